//! The single error slot behind `vpi_chk_error`.
//!
//! Raising never unwinds: conditions are recorded here, dispatched to any
//! PLI-error callbacks, and optionally escalated through the model's fatal
//! hook by the runtime.

use std::ffi::CString;

use crate::schema::values::{ErrorState, Severity};

/// Messages are formatted into a bounded buffer at raise time.
pub(crate) const MESSAGE_CAP: usize = 1024;

/// The captured error, with NUL-terminated copies for the ABI struct. The
/// pointers handed out by `vpi_chk_error` stay valid until the next raise.
#[derive(Debug)]
pub(crate) struct ErrorRecord {
    pub severity: Severity,
    pub state: ErrorState,
    pub message: CString,
    pub product: CString,
    pub file: CString,
    pub line: u32,
}

#[derive(Debug, Default)]
pub(crate) struct ErrorSlot {
    record: Option<ErrorRecord>,
}

impl ErrorSlot {
    /// Clear the flag. Designated ABI entries do this on entry;
    /// `vpi_chk_error` never does.
    pub(crate) fn reset(&mut self) {
        self.record = None;
    }

    pub(crate) fn set(
        &mut self,
        severity: Severity,
        file: &str,
        line: u32,
        product: &str,
        message: &str,
    ) {
        let mut message = message.as_bytes();
        if message.len() > MESSAGE_CAP {
            let mut cut = MESSAGE_CAP;
            while cut > 0 && message[cut] & 0xc0 == 0x80 {
                cut -= 1;
            }
            message = &message[..cut];
        }
        self.record = Some(ErrorRecord {
            severity,
            state: ErrorState::Pli,
            message: to_cstring(message),
            product: to_cstring(product.as_bytes()),
            file: to_cstring(file.as_bytes()),
            line,
        });
    }

    pub(crate) fn record(&self) -> Option<&ErrorRecord> {
        self.record.as_ref()
    }

    pub(crate) fn severity(&self) -> Option<Severity> {
        self.record.as_ref().map(|r| r.severity)
    }
}

fn to_cstring(bytes: &[u8]) -> CString {
    let cleaned: Vec<u8> = bytes.iter().copied().filter(|&b| b != 0).collect();
    // Interior NULs were just removed.
    CString::new(cleaned).unwrap_or_default()
}

/// Record a condition into the runtime's error slot, capturing the call
/// site. Dispatch to PLI-error callbacks and fatal escalation happen when
/// the current ABI call unwinds its borrow.
macro_rules! raise {
    ($rt:expr, $severity:expr, $($arg:tt)*) => {
        $rt.raise($severity, file!(), line!(), format_args!($($arg)*))
    };
}

macro_rules! raise_warning {
    ($rt:expr, $($arg:tt)*) => {
        crate::error::raise!($rt, crate::schema::values::Severity::Warning, $($arg)*)
    };
}

macro_rules! raise_error {
    ($rt:expr, $($arg:tt)*) => {
        crate::error::raise!($rt, crate::schema::values::Severity::Error, $($arg)*)
    };
}

pub(crate) use {raise, raise_error, raise_warning};

#[test]
fn test_slot_set_and_reset() {
    let mut slot = ErrorSlot::default();
    assert!(slot.record().is_none());
    slot.set(Severity::Warning, "runtime.rs", 42, "sim", "something odd");
    let record = slot.record().unwrap();
    assert_eq!(record.severity, Severity::Warning);
    assert_eq!(record.message.to_str().unwrap(), "something odd");
    assert_eq!(record.line, 42);
    slot.reset();
    assert!(slot.record().is_none());
}

#[test]
fn test_message_bounded() {
    let mut slot = ErrorSlot::default();
    let long = "x".repeat(MESSAGE_CAP * 2);
    slot.set(Severity::Error, "f", 1, "p", &long);
    assert_eq!(slot.record().unwrap().message.as_bytes().len(), MESSAGE_CAP);
}
