//! The `extern "C"` surface foreign PLI applications link against.
//!
//! Entry points validate and decode their raw arguments, take a short borrow
//! of the installed runtime, and translate results back into the standard's
//! structs. Returned string and vector pointers reference thread-local
//! buffers that stay valid until the next call of the same entry from the
//! same thread; callers must copy to persist.
//!
//! Defining C-variadic functions is not available to a stable Rust crate, so
//! the print family takes a single pre-formatted NUL-terminated string; the
//! C shim hosting the PLI application performs `vsnprintf` formatting before
//! crossing the ABI.

use std::cell::RefCell;
use std::ffi::{CStr, c_char, c_void};

use tracing::trace;

use crate::error::raise_warning;
use crate::handle::Handle;
use crate::runtime::{CbRequest, run_error_hooks, with};
use crate::schema::values::{TimeType, ValueFormat};
use crate::value::{Lane, Rendered, WriteInput};

/// `vpiHandle`: a pointer-sized opaque word.
pub type RawHandle = *mut c_void;

/// `PLI_INT32 (*)(p_cb_data)`.
pub type CbRoutine = extern "C" fn(*mut CbData) -> i32;

/// `s_vpi_time`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VpiTime {
    pub type_: i32,
    pub high: u32,
    pub low: u32,
    pub real: f64,
}

/// The union arm of `s_vpi_value`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ValueUnion {
    pub str_: *mut c_char,
    pub scalar: i32,
    pub integer: i32,
    pub real: f64,
    pub time: *mut VpiTime,
    pub vector: *mut Lane,
    pub strength: *mut c_void,
    pub misc: *mut c_char,
}

/// `s_vpi_value`.
#[repr(C)]
pub struct VpiValue {
    pub format: i32,
    pub value: ValueUnion,
}

/// `s_cb_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CbData {
    pub reason: i32,
    pub cb_rtn: Option<CbRoutine>,
    pub obj: RawHandle,
    pub time: *mut VpiTime,
    pub value: *mut VpiValue,
    pub index: i32,
    pub user_data: *mut c_char,
}

/// `s_vpi_error_info`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ErrorInfo {
    pub state: i32,
    pub level: i32,
    pub message: *mut c_char,
    pub product: *mut c_char,
    pub code: *mut c_char,
    pub file: *mut c_char,
    pub line: i32,
}

/// `s_vpi_vlog_info`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VlogInfo {
    pub argc: i32,
    pub argv: *mut *mut c_char,
    pub product: *mut c_char,
    pub version: *mut c_char,
}

thread_local! {
    /// Backing store for `vpi_get_str` returns.
    static OUT_STR: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
    /// Backing store for `vpi_get_value` text returns.
    static OUT_TEXT: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
    /// Backing store for `vpi_get_value` vector returns.
    static OUT_LANES: RefCell<Vec<Lane>> = const { RefCell::new(Vec::new()) };
}

fn decode_handle(raw: RawHandle) -> Option<Handle> {
    Handle::from_raw(raw as usize as u64)
}

fn encode_handle(handle: Option<Handle>) -> RawHandle {
    handle.map_or(0, Handle::as_raw) as usize as RawHandle
}

/// # Safety
///
/// `text` must be null or NUL-terminated.
unsafe fn decode_str(text: *const c_char) -> Option<String> {
    if text.is_null() {
        return None;
    }
    // SAFETY: per this function's contract.
    Some(unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned())
}

fn reset_error() {
    with(|rt| rt.error.reset());
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_handle_by_name(name: *const c_char, scope: RawHandle) -> RawHandle {
    reset_error();
    // SAFETY: the caller passes a NUL-terminated name.
    let Some(name) = (unsafe { decode_str(name) }) else {
        return std::ptr::null_mut();
    };
    let handle = with(|rt| rt.handle_by_name(&name, decode_handle(scope))).flatten();
    run_error_hooks();
    encode_handle(handle)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_handle_by_index(object: RawHandle, index: i32) -> RawHandle {
    reset_error();
    let handle = decode_handle(object)
        .and_then(|h| with(|rt| rt.handle_by_index(h, index)).flatten());
    run_error_hooks();
    encode_handle(handle)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_handle(rel: i32, object: RawHandle) -> RawHandle {
    reset_error();
    let handle =
        decode_handle(object).and_then(|h| with(|rt| rt.handle_rel(rel, h)).flatten());
    run_error_hooks();
    encode_handle(handle)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_iterate(kind: i32, object: RawHandle) -> RawHandle {
    reset_error();
    let handle = with(|rt| rt.iterate(kind, decode_handle(object))).flatten();
    run_error_hooks();
    encode_handle(handle)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_scan(iterator: RawHandle) -> RawHandle {
    reset_error();
    let handle = decode_handle(iterator).and_then(|h| with(|rt| rt.scan(h)).flatten());
    run_error_hooks();
    encode_handle(handle)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_get(property: i32, object: RawHandle) -> i32 {
    reset_error();
    let value = with(|rt| rt.get_int(property, decode_handle(object)))
        .unwrap_or(crate::schema::values::UNDEFINED);
    run_error_hooks();
    value
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_get_str(property: i32, object: RawHandle) -> *mut c_char {
    reset_error();
    let rendered = with(|rt| rt.get_str(property, decode_handle(object))).flatten();
    run_error_hooks();
    match rendered {
        Some(text) => OUT_STR.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();
            buf.extend_from_slice(text.as_bytes());
            buf.push(0);
            buf.as_mut_ptr().cast::<c_char>()
        }),
        None => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_get_value(expr: RawHandle, value_p: *mut VpiValue) {
    reset_error();
    if value_p.is_null() {
        with(|rt| raise_warning!(rt, "vpi_get_value: ignoring null value pointer"));
        run_error_hooks();
        return;
    }
    // SAFETY: `value_p` was just null-checked and points to a caller struct.
    let format = unsafe { (*value_p).format };
    let rendered = decode_handle(expr)
        .and_then(|h| with(|rt| rt.get_value(h, format)).flatten())
        .or_else(|| {
            if decode_handle(expr).is_none() {
                with(|rt| raise_warning!(rt, "vpi_get_value: invalid handle"));
            }
            None
        });
    run_error_hooks();
    let Some(rendered) = rendered else {
        return;
    };
    // SAFETY: writing the arms of the caller's struct; the staged pointers
    // stay valid until the next vpi_get_value on this thread.
    unsafe {
        match rendered {
            Rendered::Int(integer) => {
                (*value_p).format = ValueFormat::Int as i32;
                (*value_p).value.integer = integer;
            }
            Rendered::Lanes(lanes) => OUT_LANES.with(|buf| {
                let mut buf = buf.borrow_mut();
                *buf = lanes;
                (*value_p).value.vector = buf.as_mut_ptr();
            }),
            Rendered::Text { bytes, .. } => OUT_TEXT.with(|buf| {
                let mut buf = buf.borrow_mut();
                *buf = bytes;
                buf.push(0);
                (*value_p).value.str_ = buf.as_mut_ptr().cast::<c_char>();
            }),
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_put_value(
    object: RawHandle,
    value_p: *mut VpiValue,
    _time_p: *mut VpiTime,
    _flags: i32,
) -> RawHandle {
    reset_error();
    if value_p.is_null() {
        with(|rt| raise_warning!(rt, "vpi_put_value: ignoring null value pointer"));
        run_error_hooks();
        return std::ptr::null_mut();
    }
    let Some(handle) = decode_handle(object) else {
        with(|rt| raise_warning!(rt, "vpi_put_value: invalid handle"));
        run_error_hooks();
        return std::ptr::null_mut();
    };
    // SAFETY: `value_p` was just null-checked; the union arm read below is
    // selected by the caller-set format.
    unsafe {
        let format = (*value_p).format;
        match ValueFormat::try_from(format) {
            Ok(ValueFormat::Int) => {
                let input = WriteInput::Int((*value_p).value.integer);
                with(|rt| rt.put_value(handle, format, input));
            }
            Ok(ValueFormat::Vector) => {
                let words = with(|rt| rt.vector_words(handle)).flatten().unwrap_or(0);
                let vector = (*value_p).value.vector;
                if vector.is_null() {
                    with(|rt| raise_warning!(rt, "vpi_put_value: null vector pointer"));
                } else {
                    // SAFETY: the standard requires the caller array to span
                    // the full element width.
                    let lanes = std::slice::from_raw_parts(vector, words);
                    with(|rt| rt.put_value(handle, format, WriteInput::Lanes(lanes)));
                }
            }
            Ok(
                ValueFormat::BinStr
                | ValueFormat::OctStr
                | ValueFormat::DecStr
                | ValueFormat::HexStr
                | ValueFormat::String,
            ) => {
                let text = (*value_p).value.str_;
                if text.is_null() {
                    with(|rt| raise_warning!(rt, "vpi_put_value: null string pointer"));
                } else {
                    let bytes = CStr::from_ptr(text).to_bytes();
                    with(|rt| rt.put_value(handle, format, WriteInput::Text(bytes)));
                }
            }
            // Anything else is rejected by the marshaller without touching
            // the union.
            _ => {
                with(|rt| rt.put_value(handle, format, WriteInput::Int(0)));
            }
        }
    }
    run_error_hooks();
    std::ptr::null_mut()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_get_time(_object: RawHandle, time_p: *mut VpiTime) {
    if time_p.is_null() {
        return;
    }
    let Some(now) = with(|rt| rt.time_now()) else {
        return;
    };
    // SAFETY: `time_p` was just null-checked and points to a caller struct.
    unsafe {
        match TimeType::try_from((*time_p).type_) {
            Ok(TimeType::Sim) => {
                (*time_p).high = (now >> 32) as u32;
                (*time_p).low = now as u32;
            }
            Ok(TimeType::ScaledReal) => (*time_p).real = now as f64,
            _ => {
                with(|rt| raise_warning!(rt, "vpi_get_time: unsupported time type"));
                run_error_hooks();
            }
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_get_vlog_info(info_p: *mut VlogInfo) -> i32 {
    if info_p.is_null() {
        return 0;
    }
    let Some((argc, argv, product, version)) = with(|rt| rt.vlog_info()) else {
        return 0;
    };
    // SAFETY: `info_p` was just null-checked; the pointers stay valid for
    // the runtime's lifetime.
    unsafe {
        (*info_p).argc = argc;
        (*info_p).argv = argv;
        (*info_p).product = product;
        (*info_p).version = version;
    }
    1
}

/// Never resets the error slot; the record stays observable until the next
/// resetting entry runs.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_chk_error(info_p: *mut ErrorInfo) -> i32 {
    let filled = with(|rt| {
        let record = rt.error.record()?;
        Some((
            record.state as i32,
            record.severity as i32,
            record.message.as_ptr().cast_mut(),
            record.product.as_ptr().cast_mut(),
            record.file.as_ptr().cast_mut(),
            record.line as i32,
        ))
    })
    .flatten();
    let Some((state, level, message, product, file, line)) = filled else {
        return 0;
    };
    if !info_p.is_null() {
        // SAFETY: `info_p` was just null-checked; the string pointers stay
        // valid until the next raise.
        unsafe {
            (*info_p).state = state;
            (*info_p).level = level;
            (*info_p).message = message;
            (*info_p).product = product;
            (*info_p).code = std::ptr::null_mut();
            (*info_p).file = file;
            (*info_p).line = line;
        }
    }
    level
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_compare_objects(object1: RawHandle, object2: RawHandle) -> i32 {
    reset_error();
    let (Some(a), Some(b)) = (decode_handle(object1), decode_handle(object2)) else {
        return 0;
    };
    i32::from(with(|rt| rt.compare(a, b)).unwrap_or(false))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_release_handle(object: RawHandle) -> i32 {
    let Some(handle) = decode_handle(object) else {
        return 0;
    };
    with(|rt| rt.release_handle(handle)).unwrap_or(0)
}

/// Deprecated alias of `vpi_release_handle`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_free_object(object: RawHandle) -> i32 {
    // SAFETY: same contract as the aliased entry.
    unsafe { vpi_release_handle(object) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_register_cb(cb_data_p: *mut CbData) -> RawHandle {
    reset_error();
    if cb_data_p.is_null() {
        with(|rt| raise_warning!(rt, "vpi_register_cb: ignoring null callback data"));
        run_error_hooks();
        return std::ptr::null_mut();
    }
    // SAFETY: `cb_data_p` was just null-checked; nested pointers are read
    // behind their own null checks.
    let request = unsafe {
        let data = &*cb_data_p;
        let time = if data.time.is_null() {
            None
        } else {
            let time = &*data.time;
            match TimeType::try_from(time.type_) {
                Ok(TimeType::ScaledReal) => Some((TimeType::ScaledReal, time.real as u64)),
                Ok(kind) => Some((kind, (u64::from(time.high) << 32) | u64::from(time.low))),
                Err(_) => None,
            }
        };
        CbRequest {
            reason: data.reason,
            routine: data.cb_rtn,
            obj: decode_handle(data.obj),
            time,
            value_format: (!data.value.is_null()).then(|| (*data.value).format),
            user_data: data.user_data,
        }
    };
    trace!(reason = request.reason, "vpi_register_cb");
    let handle = with(|rt| rt.register_cb(request)).flatten();
    run_error_hooks();
    encode_handle(handle)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_remove_cb(cb_obj: RawHandle) -> i32 {
    reset_error();
    let Some(handle) = decode_handle(cb_obj) else {
        return 0;
    };
    let removed = with(|rt| rt.remove_cb(handle)).unwrap_or(0);
    run_error_hooks();
    removed
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_control(operation: i32) -> i32 {
    reset_error();
    let result = with(|rt| rt.control(operation)).unwrap_or(0);
    run_error_hooks();
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_mcd_open(path: *const c_char) -> u32 {
    // SAFETY: the caller passes a NUL-terminated path.
    let Some(path) = (unsafe { decode_str(path) }) else {
        return 0;
    };
    let mcd = with(|rt| rt.mcd_open(&path)).unwrap_or(0);
    run_error_hooks();
    mcd
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_mcd_close(mcd: u32) -> u32 {
    let result = with(|rt| rt.mcd_close(mcd)).unwrap_or(mcd);
    run_error_hooks();
    result
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_mcd_flush(mcd: u32) -> u32 {
    with(|rt| rt.mcd_flush(mcd)).unwrap_or(1)
}

/// Writes `text` as-is to every channel of `mcd`; see the module note on
/// formatting.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_mcd_printf(mcd: u32, text: *const c_char) -> i32 {
    // SAFETY: the caller passes NUL-terminated text.
    let Some(text) = (unsafe { decode_str(text) }) else {
        return 0;
    };
    let written = with(|rt| rt.mcd_write(mcd, text.as_bytes())).unwrap_or(0);
    run_error_hooks();
    written
}

/// Writes `text` as-is to stdout; see the module note on formatting.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_printf(text: *const c_char) -> i32 {
    // SAFETY: forwarding this entry's contract.
    unsafe { vpi_mcd_printf(crate::runtime::McdChannels::STDOUT.bits(), text) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn vpi_flush() -> i32 {
    with(|rt| rt.flush_all()).unwrap_or(1)
}
