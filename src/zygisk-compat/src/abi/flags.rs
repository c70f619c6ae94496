#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ZygiskOption {
    ForceDenylistUnmount = 0,
    DlcloseModuleLibrary = 1,
}
