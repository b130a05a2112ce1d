//! Discrete proxy events, emitted to `tracing` and recorded as `metrics`.

mod fair_share;

pub use fair_share::*;

/// Declares an event whose metric handles are registered once and reused on every emit.
#[doc(hidden)]
#[macro_export]
macro_rules! registered_event {
    (
        $event:ident => {
            $($field:ident: $type:ty = $value:expr,)*
        }

        fn emit(&$slf:ident $(, $arg:ident: $arg_type:ty)?) $emit_body:block
    ) => {
        #[derive(Clone)]
        pub struct $event {
            $(pub $field: $type,)*
        }

        impl $event {
            pub fn register() -> Self {
                Self {
                    $($field: $value,)*
                }
            }

            pub fn emit(&$slf $(, $arg: $arg_type)?) $emit_body
        }
    };
}
