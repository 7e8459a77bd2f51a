/// Implements the Display trait for a type by rendering it as JSON.
/// If the value cannot be serialized, it falls back to Debug formatting.
///
/// The type must implement serde's Serialize trait.
#[macro_export]
macro_rules! impl_display_using_json {
    ($type:ty) => {
        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match serde_json::to_string(self) {
                    Ok(s) => write!(f, "{}", s),
                    Err(_) => write!(f, "{:?}", self),
                }
            }
        }
    };
}
