//! Macros for reducing message boilerplate.

/// Implement `message_type()` for a type that derives `Serialize` and
/// `Deserialize`.
///
/// Use this inside your `Message` impl block as a one-liner.
///
/// # Example
///
/// ```ignore
/// use courier_core::{message_type, Message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: Uuid,
///     total_cents: i64,
/// }
///
/// impl Message for OrderPlaced {
///     message_type!("orders.placed");
/// }
/// ```
#[macro_export]
macro_rules! message_type {
    ($tag:expr) => {
        fn message_type() -> &'static str {
            $tag
        }
    };
}
