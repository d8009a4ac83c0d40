//! 宿主服务
//!
//! 以外部类的形式暴露给脚本的原生子系统，全部注册在 [`HOST_MODULE`] 模块下，
//! 由 [`PRELUDE_SOURCE`] 统一声明。脚本通过 `import "host" for ...` 使用。
//!
//! | 类              | 形式         | 说明                         |
//! |-----------------|--------------|------------------------------|
//! | `Promise`       | 脚本类       | 异步结果的续体               |
//! | `Time`          | 脚本类       | 帧号                         |
//! | `Array`         | 外部类       | 字节数组                     |
//! | `StringBuilder` | 外部类       | 字符串拼接                   |
//! | `Color`         | 外部类       | 打包的 RGBA 颜色             |
//! | `Storage`       | 静态外部方法 | 键值存储                     |
//! | `Asset`         | 静态外部方法 | 路径解析与文本加载           |
//! | `Buffer`        | 静态外部方法 | 加载为 `Array`               |
//! | `Timer`         | 静态外部方法 | 延时                         |
//! | `JavaScript`    | 静态外部方法 | 内嵌 QuickJS 求值            |

pub mod array;
pub mod asset;
pub mod color;
pub mod javascript;
pub mod promise;
pub mod storage;
pub mod string_builder;
pub mod time;
pub mod timer;

pub use array::ArrayService;
pub use asset::{resolve_path, AssetService};
pub use color::{color_library, ColorService};
pub use javascript::{JavaScriptService, JsEngine};
pub use promise::promise_library;
pub use storage::StorageService;
pub use string_builder::StringBuilderService;
pub use time::time_library;

use crate::bindings::ForeignRegistry;
use crate::config::BridgeConfig;
use crate::core::error::BridgeResult;
use crate::scripting::AsyncBridge;
use crate::vm::sandbox::ScriptLibrary;

/// 宿主前导模块名
pub const HOST_MODULE: &str = "host";

/// 宿主前导模块源码
pub const PRELUDE_SOURCE: &str = r#"# host prelude
class Promise
class Time

foreign class Array
foreign static Array.fromBase64(_)
foreign Array.count
foreign Array.resize(_)
foreign Array.getByte(_)
foreign Array.setByte(_,_)
foreign Array.fillBytes(_)
foreign Array.toBase64
foreign Array.toString
foreign Array.asString
foreign Array.setFromString(_)

foreign class StringBuilder
foreign StringBuilder.addString(_)
foreign StringBuilder.addByte(_)
foreign StringBuilder.clear()
foreign StringBuilder.count
foreign StringBuilder.toString

foreign class Color
foreign Color.r
foreign Color.g
foreign Color.b
foreign Color.a
foreign Color.r=(_)
foreign Color.g=(_)
foreign Color.b=(_)
foreign Color.a=(_)
foreign Color.uint32
foreign Color.uint32=(_)
foreign Color.toString

class Storage
foreign static Storage.contains(_)
foreign static Storage.load_(_)
foreign static Storage.save_(_,_)
foreign static Storage.delete(_)

class Asset
foreign static Asset.path(_,_)
foreign static Asset.loadString_(_,_)

class Buffer
foreign static Buffer.load_(_,_)

class Timer
foreign static Timer.sleep_(_,_)

class JavaScript
foreign static JavaScript.eval_(_,_,_,_)
"#;

/// 前导模块中脚本类的方法体
pub fn prelude_library() -> ScriptLibrary {
    let mut library = ScriptLibrary::new();
    library.extend(&promise_library(HOST_MODULE));
    library.extend(&time_library(HOST_MODULE));
    library.extend(&color_library(HOST_MODULE));
    library
}

/// 已安装的服务
///
/// 持有各服务的宿主侧状态，供宿主检查或在运行时之外直接使用。
#[derive(Clone)]
pub struct Services {
    pub storage: StorageService,
    pub arrays: ArrayService,
    pub builders: StringBuilderService,
    pub colors: ColorService,
    pub assets: AssetService,
    pub javascript: JavaScriptService,
}

/// 把所有服务注册到 [`HOST_MODULE`]
pub fn install_all(
    registry: &mut ForeignRegistry,
    bridge: &AsyncBridge,
    config: &BridgeConfig,
) -> BridgeResult<Services> {
    let storage = StorageService::new(&config.storage)?;
    storage.register(registry, HOST_MODULE)?;

    let arrays = ArrayService::new();
    arrays.register(registry, HOST_MODULE)?;

    let builders = StringBuilderService::new();
    builders.register(registry, HOST_MODULE)?;

    let colors = ColorService::new();
    colors.register(registry, HOST_MODULE)?;

    let assets = AssetService::new(&config.assets, bridge.clone());
    assets.register(registry, HOST_MODULE, &arrays)?;

    timer::register(registry, HOST_MODULE, bridge)?;

    let javascript = JavaScriptService::new(bridge.clone())?;
    javascript.register(registry, HOST_MODULE)?;

    tracing::info!(
        target: "bridge.services",
        "Installed host services ({} foreign methods, {} foreign classes)",
        registry.method_count(),
        registry.class_count()
    );

    Ok(Services {
        storage,
        arrays,
        builders,
        colors,
        assets,
        javascript,
    })
}
