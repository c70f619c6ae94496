/// Checks a `debug.mockgps.<key>` switch. Always off in release builds.
#[macro_export]
macro_rules! debug_on {
    ($key: expr) => {{
        #[cfg(debug_assertions)]
        {
            $crate::props::prop_on(concat!("debug.mockgps.", $key))
        }
        #[cfg(not(debug_assertions))]
        {
            false
        }
    }};
}
