use num_enum::TryFromPrimitive;

/// `vpiUndefined`, the sentinel returned by the integer property getter.
pub const UNDEFINED: i32 = -1;

/// Integer and string property codes (`vpi_get` / `vpi_get_str`).
#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(i32)]
#[non_exhaustive]
pub enum Property {
    Type = 1,
    Name = 2,
    FullName = 3,
    Size = 4,
    DefName = 9,
    TimeUnit = 11,
    TimePrecision = 12,
    Scalar = 17,
    Vector = 18,
    Direction = 20,
}

/// Port direction codes, pre-encoded into the variable descriptor.
#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(i32)]
pub enum Direction {
    Input = 1,
    Output = 2,
    Inout = 3,
    MixedIo = 4,
    NoDirection = 5,
}

/// Value format codes of `s_vpi_value.format`.
///
/// The runtime recognizes the eight formats named in the variant docs below;
/// the remaining codes (`vpiScalarVal`, `vpiRealVal`, `vpiStrengthVal`,
/// `vpiTimeVal`) decode but are rejected by the marshaller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
#[non_exhaustive]
pub enum ValueFormat {
    /// `vpiBinStrVal`
    BinStr = 1,
    /// `vpiOctStrVal`
    OctStr = 2,
    /// `vpiDecStrVal`
    DecStr = 3,
    /// `vpiHexStrVal`
    HexStr = 4,
    Scalar = 5,
    /// `vpiIntVal`
    Int = 6,
    Real = 7,
    /// `vpiStringVal`
    String = 8,
    /// `vpiVectorVal`
    Vector = 9,
    Strength = 10,
    Time = 11,
    /// `vpiObjTypeVal`, the "pick for me" format; treated as unsupported
    ObjType = 12,
    /// `vpiSuppressVal`, the null format on input
    Suppress = 13,
}

/// Time representation codes of `s_vpi_time.type`.
#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(i32)]
pub enum TimeType {
    /// `vpiScaledRealTime`
    ScaledReal = 1,
    /// `vpiSimTime`
    Sim = 2,
    /// `vpiSuppressTime`
    Suppress = 3,
}

/// Callback reasons this runtime schedules. Reasons outside this set fail to
/// decode; registration warns and yields a null handle.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Copy, TryFromPrimitive)]
#[repr(i32)]
#[non_exhaustive]
pub enum CbReason {
    /// `cbValueChange`
    ValueChange = 1,
    /// `cbReadWriteSynch`
    ReadWriteSynch = 6,
    /// `cbReadOnlySynch`
    ReadOnlySynch = 7,
    /// `cbNextSimTime`
    NextSimTime = 8,
    /// `cbAfterDelay`
    AfterDelay = 9,
    /// `cbStartOfSimulation`
    StartOfSimulation = 11,
    /// `cbEndOfSimulation`
    EndOfSimulation = 12,
    /// `cbError`, fired when the runtime records a PLI error
    Error = 13,
    /// `cbEnterInteractive`
    EnterInteractive = 21,
    /// `cbExitInteractive`
    ExitInteractive = 22,
    /// `cbInteractiveScopeChange`
    InteractiveScopeChange = 23,
}

/// Severity levels of the error record, `vpiNotice` through `vpiInternal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(i32)]
pub enum Severity {
    Notice = 1,
    Warning = 2,
    Error = 3,
    System = 4,
    Internal = 5,
}

/// Error state codes; this runtime only ever reports `Pli`.
#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(i32)]
pub enum ErrorState {
    Compile = 1,
    Pli = 2,
    Run = 3,
}

/// Simulator control operations (`vpi_control`).
#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(i32)]
#[non_exhaustive]
pub enum ControlOp {
    /// `vpiStop`, suspend and hand control to the host
    Stop = 66,
    /// `vpiFinish`, graceful termination
    Finish = 67,
}
