//! 核心宏定义
//!
//! 提供统一的宏来减少配置与状态结构体的样板代码

/// 为结构体实现 Default trait 的宏
///
/// 使用示例:
/// ```rust
/// use slot_bridge::impl_default;
///
/// struct SlotLimits {
///     initial: usize,
///     max: usize,
/// }
///
/// impl_default!(SlotLimits {
///     initial: 8,
///     max: 256,
/// });
/// ```
#[macro_export]
macro_rules! impl_default {
    ($struct_name:ident {
        $($field:ident: $value:expr),* $(,)?
    }) => {
        impl Default for $struct_name {
            fn default() -> Self {
                Self {
                    $($field: $value),*
                }
            }
        }
    };
}
