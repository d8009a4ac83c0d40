//! VM 边界
//!
//! 宿主与脚本 VM 之间唯一的调用面。所有参数与结果都经过槽位区传递，
//! VM 拥有的对象只能以 [`Handle`] 的形式跨越调用边界被宿主持有。
//!
//! ## 约定
//!
//! - 槽位 0 存放接收者（调用前）与结果（调用后）
//! - 槽位内容只在下一次进入 VM 之前有效
//! - 数字一律为 `f64`，布尔与 null 是独立的标签，类型化读取从不做隐式转换

pub mod handle;
pub mod sandbox;
pub mod slots;

pub use handle::{Handle, HandleId, HandleStats, HandleTable};
pub use sandbox::SandboxVm;
pub use slots::SlotArea;

use crate::core::error::{BindingError, BindingResult, SlotResult};
use std::fmt;
use std::rc::Rc;

/// 槽位中值的类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    Null,
    Bool,
    Num,
    /// 文本或原始字节
    String,
    List,
    Map,
    /// 外部对象（内嵌 [`ForeignRef`]）
    Foreign,
    /// 其他 VM 对象（类、脚本实例等），只能以句柄形式持有
    Object,
}

/// 顶层 `interpret` / `call` 的三态结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Success,
    CompileError,
    RuntimeError,
}

impl InterpretResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// 错误回调的报告种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 编译错误：模块、行号、消息
    Compile,
    /// 运行时错误：仅消息，随后是若干 `StackTrace`
    Runtime,
    /// 运行时错误的一帧调用栈，由内向外依次报告
    StackTrace,
}

/// VM 错误回调 `(kind, module, line, message)`
pub type ErrorFn = Box<dyn FnMut(ErrorKind, &str, u32, &str)>;

/// 宿主分配的外部对象标识，作为宿主侧原生状态表的键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignRef(pub u64);

impl fmt::Display for ForeignRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "foreign#{}", self.0)
    }
}

/// 预解析的 VM 可调用签名
///
/// 启动时创建一次，随 VM 一起销毁，从不单独释放。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHandle {
    id: u32,
    arity: usize,
    signature: Rc<str>,
}

impl CallHandle {
    pub fn new(id: u32, signature: &str) -> BindingResult<Self> {
        let arity = signature_arity(signature)?;
        Ok(Self {
            id,
            arity,
            signature: Rc::from(signature),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// 参数个数（不含接收者）
    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// 校验方法签名并返回参数个数
///
/// 接受三种形式：`name`（getter）、`name(_,_)`（方法）、`name=(_)`（setter）。
pub fn signature_arity(signature: &str) -> BindingResult<usize> {
    let invalid = || BindingError::InvalidSignature(signature.to_string());

    let (head, params) = match signature.find('(') {
        Some(open) => {
            let params = signature[open..]
                .strip_prefix('(')
                .and_then(|rest| rest.strip_suffix(')'))
                .ok_or_else(invalid)?;
            (&signature[..open], Some(params))
        }
        None => (signature, None),
    };

    let (name, is_setter) = match head.strip_suffix('=') {
        Some(base) => (base, true),
        None => (head, false),
    };
    if name.is_empty()
        || name.starts_with(|c: char| c.is_ascii_digit())
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(invalid());
    }

    let arity = match params {
        None => 0,
        Some("") => 0,
        Some(list) => {
            if !list.split(',').all(|p| p == "_") {
                return Err(invalid());
            }
            list.split(',').count()
        }
    };

    if is_setter && (params.is_none() || arity != 1) {
        return Err(invalid());
    }
    Ok(arity)
}

/// 宿主可见的 VM 原语
///
/// 对象安全：外部方法回调以 `&mut dyn Vm` 的形式拿到当前 VM。
/// 所有槽位操作在索引越界、标签不匹配时返回 [`SlotError`](crate::core::error::SlotError)。
pub trait Vm {
    // ---- 槽位区 ----

    /// 保证至少有 `count` 个可寻址槽位（只增不减）
    fn ensure_slots(&mut self, count: usize) -> SlotResult<()>;
    fn slot_count(&self) -> usize;
    fn slot_type(&self, slot: usize) -> SlotResult<SlotType>;

    fn get_slot_bool(&self, slot: usize) -> SlotResult<bool>;
    fn get_slot_double(&self, slot: usize) -> SlotResult<f64>;
    fn get_slot_bytes(&self, slot: usize) -> SlotResult<Vec<u8>>;
    fn get_slot_string(&self, slot: usize) -> SlotResult<String>;
    fn get_slot_foreign(&self, slot: usize) -> SlotResult<ForeignRef>;

    fn set_slot_null(&mut self, slot: usize) -> SlotResult<()>;
    fn set_slot_bool(&mut self, slot: usize, value: bool) -> SlotResult<()>;
    fn set_slot_double(&mut self, slot: usize, value: f64) -> SlotResult<()>;
    fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]) -> SlotResult<()>;
    fn set_slot_string(&mut self, slot: usize, text: &str) -> SlotResult<()>;
    fn set_slot_new_list(&mut self, slot: usize) -> SlotResult<()>;
    fn set_slot_new_map(&mut self, slot: usize) -> SlotResult<()>;

    // ---- 列表与映射 ----

    fn list_count(&self, slot: usize) -> SlotResult<usize>;
    /// 负索引从末尾计数
    fn get_list_element(&mut self, list_slot: usize, index: i64, element_slot: usize)
        -> SlotResult<()>;
    fn set_list_element(&mut self, list_slot: usize, index: i64, element_slot: usize)
        -> SlotResult<()>;
    /// `index == -1` 表示追加
    fn insert_in_list(&mut self, list_slot: usize, index: i64, element_slot: usize)
        -> SlotResult<()>;

    fn map_count(&self, slot: usize) -> SlotResult<usize>;
    fn map_contains_key(&self, map_slot: usize, key_slot: usize) -> SlotResult<bool>;
    fn get_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize)
        -> SlotResult<()>;
    fn set_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize)
        -> SlotResult<()>;
    /// 按插入顺序读取第 `index` 个键值对
    fn get_map_entry(
        &mut self,
        map_slot: usize,
        index: usize,
        key_slot: usize,
        value_slot: usize,
    ) -> SlotResult<()>;

    // ---- 外部对象 ----

    /// 以 `class_slot` 中的外部类创建实例，内嵌 `data`，结果写入 `slot`
    fn set_slot_new_foreign(&mut self, slot: usize, class_slot: usize, data: ForeignRef)
        -> SlotResult<()>;

    // ---- 句柄 ----

    /// 导出槽位中的值为句柄，必须恰好释放一次（drop 即释放）
    fn get_slot_handle(&mut self, slot: usize) -> SlotResult<Handle>;
    /// 将句柄引用的值写回槽位，不消耗句柄
    fn set_slot_handle(&mut self, slot: usize, handle: &Handle) -> SlotResult<()>;
    fn release_handle(&mut self, handle: Handle) {
        handle.release();
    }
    fn handle_table(&self) -> &Rc<HandleTable>;

    // ---- 调用 ----

    fn make_call_handle(&mut self, signature: &str) -> BindingResult<CallHandle>;
    /// 以槽位 0 为接收者、槽位 1..=arity 为参数同步调用；成功后结果位于槽位 0
    fn call(&mut self, method: &CallHandle) -> InterpretResult;
    fn interpret(&mut self, module: &str, source: &str) -> InterpretResult;

    fn has_module(&self, module: &str) -> bool;
    fn has_variable(&self, module: &str, name: &str) -> bool;
    fn get_variable(&mut self, module: &str, name: &str, slot: usize) -> SlotResult<()>;

    /// 以槽位中的值作为错误终止当前 fiber
    fn abort_fiber(&mut self, slot: usize) -> SlotResult<()>;
    /// 当前嵌套的 VM 执行层数，0 表示 VM 空闲
    fn call_depth(&self) -> usize;
    fn collect_garbage(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_arity() {
        assert_eq!(signature_arity("toString").unwrap(), 0);
        assert_eq!(signature_arity("call()").unwrap(), 0);
        assert_eq!(signature_arity("update_(_)").unwrap(), 1);
        assert_eq!(signature_arity("resolve_(_,_)").unwrap(), 2);
        assert_eq!(signature_arity("r=(_)").unwrap(), 1);
    }

    #[test]
    fn test_malformed_signatures() {
        for bad in ["", "f(", "f(x)", "f(_,)", "r=", "r=(_,_)", "1abc", "a b()"] {
            assert!(
                matches!(signature_arity(bad), Err(BindingError::InvalidSignature(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_call_handle_arity() {
        let handle = CallHandle::new(3, "update_(_,_,_)").unwrap();
        assert_eq!(handle.arity(), 3);
        assert_eq!(handle.signature(), "update_(_,_,_)");
    }
}
