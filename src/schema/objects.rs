use num_enum::TryFromPrimitive;

/// Object type codes from IEEE 1800 `vpi_user.h`, restricted to the kinds
/// this runtime materializes. Codes outside this set fail to decode and are
/// reported through the unsupported-object path.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Copy, TryFromPrimitive)]
#[repr(i32)]
#[non_exhaustive]
pub enum ObjectType {
    /// `vpiConstant`, returned for range endpoints
    Constant = 7,

    /// `vpiIterator`
    Iterator = 27,

    /// `vpiMemory`, a variable with two dimensions
    Memory = 29,

    /// `vpiMemoryWord`, one selected element of a memory
    MemoryWord = 30,

    /// `vpiModule`
    Module = 32,

    /// `vpiReg`, scalar and packed-vector variables
    Reg = 48,

    /// `vpiScope`
    Scope = 84,

    /// `vpiCallback`
    Callback = 107,

    /// `vpiRange`
    Range = 115,
}

/// Method (relation) codes accepted by `vpi_handle` and `vpi_iterate`.
///
/// `vpi_iterate` additionally accepts `ObjectType` codes (`Reg` over a scope,
/// `MemoryWord` over a memory); those are decoded separately.
#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(i32)]
#[non_exhaustive]
pub enum Method {
    /// `vpiLeftRange`
    LeftRange = 79,

    /// `vpiRightRange`
    RightRange = 83,
}
