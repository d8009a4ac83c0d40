//! 内嵌 JavaScript 求值
//!
//! `JavaScript.eval_(mode, values, names, source)`：
//!
//! - `mode` 为 Bool 时同步求值，结果的 JSON 文本写回槽位 0
//! - `mode` 为 Promise 对象时，结果经异步桥在下一次 pump 时交付
//! - `values` / `names` 是 JSON 文本或 null（视为空列表），`names` 必须是字符串数组
//!
//! 源码作为函数体执行，参数按名字绑定，返回值经 `JSON.stringify` 转换；
//! 返回 `undefined` 时结果为 `"null"`。

use crate::bindings::marshal::expect_string;
use crate::bindings::ForeignRegistry;
use crate::core::error::{BindingResult, BridgeError, BridgeResult};
use crate::scripting::{AsyncBridge, AsyncValue};
use crate::vm::{SlotType, Vm};
use rquickjs::{Context, Runtime};
use std::rc::Rc;

const INVALID_ARGS: &str = "invalid args";

/// QuickJS 运行时与上下文
pub struct JsEngine {
    _runtime: Runtime,
    context: Context,
}

impl JsEngine {
    pub fn new() -> BridgeResult<Self> {
        let runtime = Runtime::new()
            .map_err(|e| BridgeError::General(format!("Failed to create JS runtime: {}", e)))?;
        let context = Context::full(&runtime)
            .map_err(|e| BridgeError::General(format!("Failed to create JS context: {}", e)))?;
        Ok(Self {
            _runtime: runtime,
            context,
        })
    }

    /// 以 `names` 为形参、`values` 为实参执行 `source`，返回结果的 JSON 文本
    ///
    /// 失败时返回异常消息。
    pub fn eval(&self, source: &str, values: &serde_json::Value, names: &[String]) -> Result<String, String> {
        let script = format!(
            "JSON.stringify((function({}) {{\n{}\n}}).apply(null, {}))",
            names.join(", "),
            source,
            values
        );
        self.context.with(|ctx| match ctx.eval::<Option<String>, _>(script) {
            Ok(json) => Ok(json.unwrap_or_else(|| "null".to_string())),
            Err(rquickjs::Error::Exception) => Err(describe_exception(ctx.catch())),
            Err(err) => Err(err.to_string()),
        })
    }
}

fn describe_exception(value: rquickjs::Value<'_>) -> String {
    if let Some(message) = value.as_exception().and_then(|e| e.message()) {
        return message;
    }
    if let Some(text) = value.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }
    format!("{:?}", value)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// 读取 JSON 参数槽位，null 视为空列表
fn json_slot(vm: &dyn Vm, slot: usize) -> BridgeResult<serde_json::Value> {
    match vm.slot_type(slot)? {
        SlotType::Null => Ok(serde_json::Value::Array(Vec::new())),
        SlotType::String => {
            let text = expect_string(vm, slot, "JS args")?;
            serde_json::from_str(&text).map_err(|_| BridgeError::abort("invalid JSON for JS args"))
        }
        _ => Err(BridgeError::abort("expected string or null for JS args")),
    }
}

/// 校验参数列表，返回 (实参数组, 形参名)
fn eval_args(values: serde_json::Value, names: serde_json::Value) -> BridgeResult<(serde_json::Value, Vec<String>)> {
    const SHAPE: &str = "arg values and names must be Lists, arg names must be a String[]";

    let (Some(value_count), Some(raw_names)) = (values.as_array().map(Vec::len), names.as_array()) else {
        return Err(BridgeError::abort(SHAPE));
    };
    let names = raw_names
        .iter()
        .map(|name| name.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| BridgeError::abort(SHAPE))?;

    if value_count != names.len() {
        return Err(BridgeError::abort("arg values and names must have same length"));
    }
    if let Some(bad) = names.iter().find(|name| !is_identifier(name)) {
        return Err(BridgeError::abort(format!("invalid arg name '{}'", bad)));
    }
    Ok((values, names))
}

/// JavaScript 求值服务
#[derive(Clone)]
pub struct JavaScriptService {
    engine: Rc<JsEngine>,
    bridge: AsyncBridge,
}

impl JavaScriptService {
    pub fn new(bridge: AsyncBridge) -> BridgeResult<Self> {
        Ok(Self {
            engine: Rc::new(JsEngine::new()?),
            bridge,
        })
    }

    pub fn engine(&self) -> &JsEngine {
        &self.engine
    }

    pub fn register(&self, registry: &mut ForeignRegistry, module: &str) -> BindingResult<()> {
        let service = self.clone();
        registry.register_method(module, "JavaScript", true, "eval_(_,_,_,_)", move |vm| {
            let sync = match vm.slot_type(1)? {
                SlotType::Bool => true,
                SlotType::Object | SlotType::Foreign => false,
                _ => return Err(BridgeError::abort(INVALID_ARGS)),
            };
            let source = expect_string(vm, 4, "source").map_err(|_| BridgeError::abort(INVALID_ARGS))?;
            let (values, names) = eval_args(json_slot(vm, 2)?, json_slot(vm, 3)?)?;

            let result = service.engine.eval(&source, &values, &names);
            if sync {
                let json = result.map_err(|message| BridgeError::abort(format!("JavaScript error: {}", message)))?;
                vm.set_slot_string(0, &json)?;
            } else {
                let continuation = vm.get_slot_handle(1)?;
                let outcome = result
                    .map(AsyncValue::Text)
                    .map_err(|message| format!("JavaScript error: {}", message));
                service.bridge.settle_ready(continuation, outcome)?;
                vm.set_slot_null(0)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eval_binds_named_arguments() {
        let engine = JsEngine::new().unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        assert_eq!(engine.eval("return a + b;", &json!([1, 2]), &names).unwrap(), "3");
        assert_eq!(
            engine.eval("return { sum: a + b, list: [a, b] };", &json!([1, 2]), &names).unwrap(),
            r#"{"sum":3,"list":[1,2]}"#
        );
        assert_eq!(engine.eval("let x = 1;", &json!([]), &[]).unwrap(), "null");
    }

    #[test]
    fn test_eval_reports_exceptions() {
        let engine = JsEngine::new().unwrap();
        let message = engine.eval("throw new Error('boom');", &json!([]), &[]).unwrap_err();
        assert!(message.contains("boom"));
        assert!(engine.eval("return (", &json!([]), &[]).is_err());
    }

    #[test]
    fn test_argument_validation() {
        assert!(eval_args(json!([1]), json!(["a"])).is_ok());
        let shape = eval_args(json!({}), json!([])).unwrap_err();
        assert_eq!(shape.abort_message(), "arg values and names must be Lists, arg names must be a String[]");
        let names = eval_args(json!([1]), json!([1])).unwrap_err();
        assert_eq!(names.abort_message(), "arg values and names must be Lists, arg names must be a String[]");
        let length = eval_args(json!([1, 2]), json!(["a"])).unwrap_err();
        assert_eq!(length.abort_message(), "arg values and names must have same length");
        assert!(eval_args(json!([1]), json!(["a b"])).is_err());
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("value"));
        assert!(is_identifier("_x1"));
        assert!(is_identifier("$"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
