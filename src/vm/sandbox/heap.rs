//! 沙盒 VM 的对象堆
//!
//! 槽位 + 代数编号的对象表，标记-清除回收。

use super::library::ScriptMethodFn;
use crate::bindings::registry::{ForeignClassMethods, ForeignMethodFn};
use crate::vm::{ForeignRef, SlotType};
use std::collections::HashMap;
use std::rc::Rc;

/// 对象引用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

/// VM 值
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Num(f64),
    Str(Rc<[u8]>),
    Obj(ObjRef),
}

impl Value {
    pub fn string(text: &str) -> Self {
        Self::Str(Rc::from(text.as_bytes()))
    }

    pub fn bytes(bytes: &[u8]) -> Self {
        Self::Str(Rc::from(bytes))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Str(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Self::Obj(r) => Some(*r),
            _ => None,
        }
    }

    /// 映射键的相等性：标量按值，对象按身份
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Num(a), Self::Num(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Obj(a), Self::Obj(b)) => a == b,
            _ => false,
        }
    }
}

/// 类上的方法体
#[derive(Clone)]
pub enum Method {
    Foreign(ForeignMethodFn),
    Script(ScriptMethodFn),
    /// 以新实例为接收者运行的构造体
    Constructor(ScriptMethodFn),
}

pub struct ClassObj {
    pub module: String,
    pub name: String,
    /// 外部类的分配/终结回调
    pub foreign: Option<ForeignClassMethods>,
    /// (是否静态, 签名) → 方法
    pub methods: HashMap<(bool, String), Method>,
    pub static_fields: HashMap<String, Value>,
}

pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: HashMap<String, Value>,
}

pub struct ForeignObj {
    pub class: ObjRef,
    pub data: ForeignRef,
}

pub enum Object {
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Class(ClassObj),
    Instance(InstanceObj),
    Foreign(ForeignObj),
}

impl Object {
    pub fn slot_type(&self) -> SlotType {
        match self {
            Self::List(_) => SlotType::List,
            Self::Map(_) => SlotType::Map,
            Self::Foreign(_) => SlotType::Foreign,
            Self::Class(_) | Self::Instance(_) => SlotType::Object,
        }
    }

    fn trace(&self, out: &mut Vec<ObjRef>) {
        let values: Box<dyn Iterator<Item = &Value>> = match self {
            Self::List(items) => Box::new(items.iter()),
            Self::Map(entries) => Box::new(entries.iter().flat_map(|(k, v)| [k, v])),
            Self::Class(class) => Box::new(class.static_fields.values()),
            Self::Instance(instance) => {
                out.push(instance.class);
                Box::new(instance.fields.values())
            }
            Self::Foreign(foreign) => {
                out.push(foreign.class);
                return;
            }
        };
        out.extend(values.filter_map(Value::as_obj));
    }
}

struct Entry {
    generation: u32,
    marked: bool,
    object: Option<Object>,
}

/// 被回收的外部对象：需要调用的终结回调及其数据
pub type DeadForeign = (ForeignClassMethods, ForeignRef);

#[derive(Default)]
pub struct Heap {
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.generation = entry.generation.wrapping_add(1);
            entry.marked = false;
            entry.object = Some(object);
            return ObjRef {
                index,
                generation: entry.generation,
            };
        }
        self.entries.push(Entry {
            generation: 0,
            marked: false,
            object: Some(object),
        });
        ObjRef {
            index: (self.entries.len() - 1) as u32,
            generation: 0,
        }
    }

    pub fn get(&self, r: ObjRef) -> Option<&Object> {
        self.entries
            .get(r.index as usize)
            .filter(|entry| entry.generation == r.generation)
            .and_then(|entry| entry.object.as_ref())
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut Object> {
        self.entries
            .get_mut(r.index as usize)
            .filter(|entry| entry.generation == r.generation)
            .and_then(|entry| entry.object.as_mut())
    }

    pub fn class(&self, r: ObjRef) -> Option<&ClassObj> {
        match self.get(r) {
            Some(Object::Class(class)) => Some(class),
            _ => None,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    /// 标记-清除，返回需要终结的外部对象
    pub fn collect<'a>(&mut self, roots: impl IntoIterator<Item = &'a Value>) -> Vec<DeadForeign> {
        let mut work: Vec<ObjRef> = roots.into_iter().filter_map(Value::as_obj).collect();
        while let Some(r) = work.pop() {
            let Some(entry) = self.entries.get_mut(r.index as usize) else {
                continue;
            };
            if entry.generation != r.generation || entry.marked {
                continue;
            }
            entry.marked = true;
            if let Some(object) = &entry.object {
                object.trace(&mut work);
            }
        }

        // 先在类仍然存在时收集终结信息
        let mut dead = Vec::new();
        for entry in &self.entries {
            if entry.marked {
                continue;
            }
            if let Some(Object::Foreign(foreign)) = &entry.object {
                if let Some(methods) = self.class(foreign.class).and_then(|c| c.foreign.clone()) {
                    dead.push((methods, foreign.data));
                }
            }
        }

        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.marked {
                entry.marked = false;
            } else if entry.object.take().is_some() {
                self.live -= 1;
                self.free.push(index as u32);
            }
        }
        dead
    }

    /// 清空整个堆，返回所有外部对象的终结信息
    pub fn clear(&mut self) -> Vec<DeadForeign> {
        let dead = self.collect(std::iter::empty());
        self.entries.clear();
        self.free.clear();
        self.live = 0;
        dead
    }
}
