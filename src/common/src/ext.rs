use log::{error, warn};
use std::fmt::{Debug, Display};

pub trait ResultExt<T> {
    fn ok_or_warn(self) -> Option<T>;
    fn log_with_context<C: Display>(self, context: C);
}

impl<T, E: Debug> ResultExt<T> for Result<T, E> {
    fn ok_or_warn(self) -> Option<T> {
        self.inspect_err(|err| warn!("{err:?}")).ok()
    }

    fn log_with_context<C: Display>(self, context: C) {
        if let Err(err) = self {
            error!("{context}: {err:?}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ResultExt;

    #[test]
    fn ok_or_warn_keeps_value() {
        let value: Result<u32, &str> = Ok(7);
        assert_eq!(value.ok_or_warn(), Some(7));
    }

    #[test]
    fn ok_or_warn_drops_error() {
        let value: Result<u32, &str> = Err("gone");
        assert_eq!(value.ok_or_warn(), None);
    }
}
