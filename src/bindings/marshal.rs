//! 类型编组
//!
//! 宿主值 [`HostValue`] 与槽位值之间的转换。列表和映射没有批量转换原语，
//! 只能借助临时槽位逐元素复制；临时槽位总是分配在当前槽位数之上，
//! 不会覆盖调用方已经放好的参数。
//!
//! 外部对象和普通 VM 对象不能编组为宿主值，必须以句柄形式传递。

use crate::core::error::{BridgeError, BridgeResult, MarshalError, MarshalResult};
use crate::vm::{SlotType, Vm};
use base64::Engine as _;

/// 默认最大嵌套深度
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// 宿主侧拥有的值
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Null,
    Bool(bool),
    Num(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<HostValue>),
    /// 保持插入顺序的键值对
    Map(Vec<(HostValue, HostValue)>),
}

impl HostValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Num(_) => "number",
            Self::Text(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// 从 JSON 值转换
    ///
    /// 无法用 `f64` 精确表示的数字会被拒绝。
    pub fn from_json(value: &serde_json::Value) -> MarshalResult<Self> {
        use serde_json::Value;
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Num(json_number(n)?),
            Value::String(s) => Self::Text(s.clone()),
            Value::Array(items) => Self::List(
                items
                    .iter()
                    .map(Self::from_json)
                    .collect::<MarshalResult<Vec<_>>>()?,
            ),
            Value::Object(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((Self::Text(k.clone()), Self::from_json(v)?)))
                    .collect::<MarshalResult<Vec<_>>>()?,
            ),
        })
    }

    /// 转换为 JSON 值
    ///
    /// 字节编码为 base64 文本；非有限数字和非字符串键会被拒绝。
    pub fn to_json(&self) -> MarshalResult<serde_json::Value> {
        use serde_json::Value;
        Ok(match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Num(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .ok_or_else(|| MarshalError::UnsupportedType(format!("non-finite number {}", n)))?,
            Self::Text(s) => Value::String(s.clone()),
            Self::Bytes(bytes) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            Self::List(items) => Value::Array(
                items
                    .iter()
                    .map(HostValue::to_json)
                    .collect::<MarshalResult<Vec<_>>>()?,
            ),
            Self::Map(entries) => {
                let mut object = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = match key {
                        Self::Text(key) => key.clone(),
                        other => {
                            return Err(MarshalError::UnsupportedType(format!(
                                "{} map key in JSON object",
                                other.type_name()
                            )))
                        }
                    };
                    object.insert(key, value.to_json()?);
                }
                Value::Object(object)
            }
        })
    }
}

impl TryFrom<serde_json::Value> for HostValue {
    type Error = MarshalError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        Self::from_json(&value)
    }
}

/// 2^53：超出此范围的整数在 `f64` 中会丢失精度
const MAX_SAFE_INTEGER: u64 = 1 << 53;

fn json_number(n: &serde_json::Number) -> MarshalResult<f64> {
    let unrepresentable = || MarshalError::UnsupportedType(format!("number {} cannot be represented exactly", n));
    if let Some(u) = n.as_u64() {
        return if u <= MAX_SAFE_INTEGER { Ok(u as f64) } else { Err(unrepresentable()) };
    }
    if let Some(i) = n.as_i64() {
        return if i.unsigned_abs() <= MAX_SAFE_INTEGER { Ok(i as f64) } else { Err(unrepresentable()) };
    }
    n.as_f64().ok_or_else(unrepresentable)
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Num(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// 带嵌套深度上限的编组器
#[derive(Debug, Clone, Copy)]
pub struct Marshaller {
    max_depth: usize,
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl Marshaller {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// 将宿主值写入槽位
    pub fn write(&self, vm: &mut dyn Vm, slot: usize, value: &HostValue) -> MarshalResult<()> {
        self.write_at(vm, slot, value, 0)
    }

    /// 读取槽位为宿主值
    ///
    /// 文本若不是合法 UTF-8 则读为 `Bytes`。
    pub fn read(&self, vm: &mut dyn Vm, slot: usize) -> MarshalResult<HostValue> {
        self.read_at(vm, slot, 0)
    }

    fn write_at(
        &self,
        vm: &mut dyn Vm,
        slot: usize,
        value: &HostValue,
        depth: usize,
    ) -> MarshalResult<()> {
        match value {
            HostValue::Null => vm.set_slot_null(slot)?,
            HostValue::Bool(b) => vm.set_slot_bool(slot, *b)?,
            HostValue::Num(n) => vm.set_slot_double(slot, *n)?,
            HostValue::Text(text) => vm.set_slot_string(slot, text)?,
            HostValue::Bytes(bytes) => vm.set_slot_bytes(slot, bytes)?,
            HostValue::List(items) => {
                self.check_depth(depth)?;
                vm.set_slot_new_list(slot)?;
                let scratch = vm.slot_count();
                vm.ensure_slots(scratch + 1)?;
                for item in items {
                    self.write_at(vm, scratch, item, depth + 1)?;
                    vm.insert_in_list(slot, -1, scratch)?;
                }
            }
            HostValue::Map(entries) => {
                self.check_depth(depth)?;
                vm.set_slot_new_map(slot)?;
                let scratch = vm.slot_count();
                vm.ensure_slots(scratch + 2)?;
                for (key, value) in entries {
                    self.write_at(vm, scratch, key, depth + 1)?;
                    self.write_at(vm, scratch + 1, value, depth + 1)?;
                    vm.set_map_value(slot, scratch, scratch + 1)?;
                }
            }
        }
        Ok(())
    }

    fn read_at(&self, vm: &mut dyn Vm, slot: usize, depth: usize) -> MarshalResult<HostValue> {
        Ok(match vm.slot_type(slot)? {
            SlotType::Null => HostValue::Null,
            SlotType::Bool => HostValue::Bool(vm.get_slot_bool(slot)?),
            SlotType::Num => HostValue::Num(vm.get_slot_double(slot)?),
            SlotType::String => match String::from_utf8(vm.get_slot_bytes(slot)?) {
                Ok(text) => HostValue::Text(text),
                Err(err) => HostValue::Bytes(err.into_bytes()),
            },
            SlotType::List => {
                self.check_depth(depth)?;
                let count = vm.list_count(slot)?;
                let scratch = vm.slot_count();
                vm.ensure_slots(scratch + 1)?;
                let mut items = Vec::with_capacity(count);
                for index in 0..count {
                    vm.get_list_element(slot, index as i64, scratch)?;
                    items.push(self.read_at(vm, scratch, depth + 1)?);
                }
                HostValue::List(items)
            }
            SlotType::Map => {
                self.check_depth(depth)?;
                let count = vm.map_count(slot)?;
                let scratch = vm.slot_count();
                vm.ensure_slots(scratch + 2)?;
                let mut entries = Vec::with_capacity(count);
                for index in 0..count {
                    vm.get_map_entry(slot, index, scratch, scratch + 1)?;
                    let key = self.read_at(vm, scratch, depth + 1)?;
                    let value = self.read_at(vm, scratch + 1, depth + 1)?;
                    entries.push((key, value));
                }
                HostValue::Map(entries)
            }
            SlotType::Foreign => {
                return Err(MarshalError::UnsupportedType(format!(
                    "foreign object in slot {} must be passed as a handle",
                    slot
                )))
            }
            SlotType::Object => {
                return Err(MarshalError::UnsupportedType(format!(
                    "object in slot {} must be passed as a handle",
                    slot
                )))
            }
        })
    }

    fn check_depth(&self, depth: usize) -> MarshalResult<()> {
        if depth >= self.max_depth {
            Err(MarshalError::DepthExceeded(self.max_depth))
        } else {
            Ok(())
        }
    }
}

/// 以默认深度写入
pub fn write_slot(vm: &mut dyn Vm, slot: usize, value: &HostValue) -> MarshalResult<()> {
    Marshaller::default().write(vm, slot, value)
}

/// 以默认深度读取
pub fn read_slot(vm: &mut dyn Vm, slot: usize) -> MarshalResult<HostValue> {
    Marshaller::default().read(vm, slot)
}

// ---- 外部方法参数校验 ----
//
// 失败时返回 `BridgeError::Abort`，由 VM 转为 fiber 终止。

fn expect_type(vm: &dyn Vm, slot: usize, expected: SlotType, message: String) -> BridgeResult<()> {
    if vm.slot_type(slot)? == expected {
        Ok(())
    } else {
        Err(BridgeError::abort(message))
    }
}

pub fn expect_bool(vm: &dyn Vm, slot: usize, what: &str) -> BridgeResult<bool> {
    expect_type(vm, slot, SlotType::Bool, format!("{} must be a bool", what))?;
    Ok(vm.get_slot_bool(slot)?)
}

pub fn expect_num(vm: &dyn Vm, slot: usize, what: &str) -> BridgeResult<f64> {
    expect_type(vm, slot, SlotType::Num, format!("{} must be a number", what))?;
    Ok(vm.get_slot_double(slot)?)
}

pub fn expect_string(vm: &dyn Vm, slot: usize, what: &str) -> BridgeResult<String> {
    expect_type(vm, slot, SlotType::String, format!("{} must be a string", what))?;
    vm.get_slot_string(slot)
        .map_err(|_| BridgeError::abort(format!("{} must be valid UTF-8", what)))
}

pub fn expect_bytes(vm: &dyn Vm, slot: usize, what: &str) -> BridgeResult<Vec<u8>> {
    expect_type(vm, slot, SlotType::String, format!("{} must be a string", what))?;
    Ok(vm.get_slot_bytes(slot)?)
}

/// 槽位必须是对象（外部对象或其他 VM 对象）
pub fn expect_object(vm: &dyn Vm, slot: usize, what: &str) -> BridgeResult<()> {
    match vm.slot_type(slot)? {
        SlotType::Foreign | SlotType::Object => Ok(()),
        _ => Err(BridgeError::abort(format!("{} must be an object", what))),
    }
}

fn expect_integer(vm: &dyn Vm, slot: usize, what: &str) -> BridgeResult<f64> {
    let value = expect_num(vm, slot, what)?;
    if value.fract() != 0.0 || !value.is_finite() {
        return Err(BridgeError::abort(format!("{} must be an integer", what)));
    }
    Ok(value)
}

/// 校验下标：必须是整数，负数从末尾计数，越界终止
pub fn validate_index(vm: &dyn Vm, slot: usize, count: usize, what: &str) -> BridgeResult<usize> {
    let mut index = expect_integer(vm, slot, what)?;
    if index < 0.0 {
        index += count as f64;
    }
    if index < 0.0 || index >= count as f64 {
        return Err(BridgeError::abort(format!("{} out of bounds", what)));
    }
    Ok(index as usize)
}

/// 校验长度：非负整数
pub fn validate_length(vm: &dyn Vm, slot: usize, what: &str) -> BridgeResult<usize> {
    let value = expect_integer(vm, slot, what)?;
    if value < 0.0 || value > u32::MAX as f64 {
        return Err(BridgeError::abort(format!(
            "{} must be a non-negative integer",
            what
        )));
    }
    Ok(value as usize)
}
