//! 资源加载
//!
//! `Asset` 与 `Buffer` 两个静态类。脚本中的路径都是以 `/` 开头、相对于
//! 资源根目录的绝对路径；读取在调度器上分块进行，每块上报一次进度，
//! 完成后经异步桥解析脚本传入的 Promise。

use crate::bindings::marshal::{expect_object, expect_string, HostValue};
use crate::bindings::ForeignRegistry;
use crate::config::AssetConfig;
use crate::core::error::{BindingResult, BridgeError, BridgeResult};
use crate::scripting::{AsyncBridge, AsyncValue, ProgressReporter};
use crate::services::array::ArrayService;
use crate::vm::{Handle, Vm};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

/// 路径最多包含的段数
const MAX_PARTS: usize = 16;

const INVALID_ARGS: &str = "invalid args";

/// 相对路径解析
///
/// - `curr` 是当前文件的绝对路径，例如 `/sprites/creatures/yoshi.png`
/// - `path` 为空或 `.` 时返回 `curr`
/// - 以 `/` 开头的 `path` 是绝对路径，否则相对于 `curr` 所在目录
/// - `..` 回退一级，允许越过根目录
///
/// 结果为空或超过段数上限时返回 `None`。
pub fn resolve_path(curr: &str, path: &str) -> Option<String> {
    if path.is_empty() || path == "." {
        return Some(curr.to_string());
    }

    let mut parts: Vec<&str> = Vec::new();
    let relative = match path.strip_prefix('/') {
        Some(absolute) => absolute,
        None => {
            // 当前文件所在目录的各段，不含文件名
            let dir = curr.strip_prefix('/').unwrap_or(curr);
            let mut segments: Vec<&str> = dir.split('/').collect();
            segments.pop();
            for segment in segments.into_iter().filter(|s| !s.is_empty()) {
                if parts.len() >= MAX_PARTS {
                    return None;
                }
                parts.push(segment);
            }
            path.strip_prefix("./").unwrap_or(path)
        }
    };

    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => {
                if parts.len() >= MAX_PARTS {
                    return None;
                }
                parts.push(segment);
            }
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().map(|part| format!("/{}", part)).collect())
}

/// 资源服务
#[derive(Clone)]
pub struct AssetService {
    root: PathBuf,
    chunk_size: usize,
    bridge: AsyncBridge,
}

impl AssetService {
    pub fn new(config: &AssetConfig, bridge: AsyncBridge) -> Self {
        Self {
            root: config.root.clone(),
            chunk_size: config.chunk_size.max(1),
            bridge,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 脚本路径映射到资源根目录下的文件
    pub fn file_path(&self, path: &str) -> BridgeResult<PathBuf> {
        let resolved = resolve_path("/", path).ok_or_else(|| BridgeError::abort("invalid path"))?;
        Ok(self.root.join(resolved.trim_start_matches('/')))
    }

    pub fn register(&self, registry: &mut ForeignRegistry, module: &str, arrays: &ArrayService) -> BindingResult<()> {
        registry.register_method(module, "Asset", true, "path(_,_)", |vm| {
            let curr = expect_string(vm, 1, "current path").map_err(|_| BridgeError::abort(INVALID_ARGS))?;
            let path = expect_string(vm, 2, "path").map_err(|_| BridgeError::abort(INVALID_ARGS))?;
            let resolved = resolve_path(&curr, &path).ok_or_else(|| BridgeError::abort("invalid path"))?;
            vm.set_slot_string(0, &resolved)?;
            Ok(())
        })?;

        let assets = self.clone();
        registry.register_method(module, "Asset", true, "loadString_(_,_)", move |vm| {
            let (file, continuation) = assets.load_args(vm)?;
            let chunk_size = assets.chunk_size;
            assets.bridge.spawn(continuation, move |progress| async move {
                read_chunked(file, chunk_size, progress).await.map(HostValue::Bytes)
            })?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;

        let assets = self.clone();
        let arrays = arrays.clone();
        let class_module = module.to_string();
        registry.register_method(module, "Buffer", true, "load_(_,_)", move |vm| {
            let (file, continuation) = assets.load_args(vm)?;
            let chunk_size = assets.chunk_size;
            let arrays = arrays.clone();
            let class_module = class_module.clone();
            assets.bridge.spawn_with_finisher(
                continuation,
                move |progress| async move {
                    read_chunked(file, chunk_size, progress).await.map(HostValue::Bytes)
                },
                move |vm, value| {
                    let bytes = match value {
                        HostValue::Bytes(bytes) => bytes,
                        other => {
                            return Err(BridgeError::General(format!(
                                "expected bytes, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    vm.ensure_slots(2)?;
                    vm.get_variable(&class_module, "Array", 1)?;
                    arrays.create(vm, 0, 1, bytes)?;
                    Ok(AsyncValue::Handle(vm.get_slot_handle(0)?))
                },
            )?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;
        Ok(())
    }

    /// 槽位 1 为路径，槽位 2 为续体；先校验再导出句柄
    fn load_args(&self, vm: &mut dyn Vm) -> BridgeResult<(PathBuf, Handle)> {
        let path = expect_string(vm, 1, "path").map_err(|_| BridgeError::abort(INVALID_ARGS))?;
        expect_object(vm, 2, "promise")?;
        let file = self.file_path(&path)?;
        tracing::debug!(target: "bridge.services", "Loading asset {} from {:?}", path, file);
        let continuation = vm.get_slot_handle(2)?;
        Ok((file, continuation))
    }
}

/// 分块读取整个文件，每块之后上报已读比例
pub async fn read_chunked(file: PathBuf, chunk_size: usize, progress: ProgressReporter) -> Result<Vec<u8>, String> {
    let display = file.display().to_string();
    let mut handle = tokio::fs::File::open(&file)
        .await
        .map_err(|e| format!("could not load {}: {}", display, e))?;
    let total = handle.metadata().await.map(|m| m.len()).unwrap_or(0);

    let mut data = Vec::with_capacity(total as usize);
    let mut chunk = vec![0u8; chunk_size];
    loop {
        let read = handle
            .read(&mut chunk)
            .await
            .map_err(|e| format!("could not read {}: {}", display, e))?;
        if read == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..read]);
        if total > 0 {
            progress.report(data.len() as f64 / total as f64);
        }
    }
    Ok(data)
}
