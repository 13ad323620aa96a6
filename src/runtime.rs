//! The runtime object behind every ABI entry point.
//!
//! One `VpiRuntime` is installed per driver thread at startup and torn down
//! at shutdown. ABI shims and dispatch passes take short borrows of the
//! thread-local slot; no borrow is ever held across a foreign callback
//! invocation, so callbacks may re-enter any entry point.

use std::cell::RefCell;
use std::ffi::{CString, c_char};
use std::fmt;
use std::fs::File;
use std::io::Write;

use tracing::{debug, trace};

use crate::error::{ErrorSlot, raise_error, raise_warning};
use crate::ffi::{CbData, CbRoutine, RawHandle, ValueUnion, VpiTime, VpiValue};
use crate::handle::{Handle, HandleObject, HandleTable, VarRef};
use crate::model::{Design, SimulatorModel, Variable};
use crate::schedule::{Callback, CallbackRegistry};
use crate::schema::objects::{Method, ObjectType};
use crate::schema::values::{
    CbReason, ControlOp, Property, Severity, TimeType, UNDEFINED, ValueFormat,
};
use crate::value::{self, Access, Lane, Rendered, WriteInput};

thread_local! {
    static RUNTIME: RefCell<Option<VpiRuntime>> = const { RefCell::new(None) };
}

/// Install the runtime for this thread. The generated model calls this once
/// at startup, before any foreign code runs; a previous installation is
/// replaced.
pub fn install(model: Box<dyn SimulatorModel>, design: Design) {
    let runtime = VpiRuntime::new(model, design);
    RUNTIME.with(|slot| *slot.borrow_mut() = Some(runtime));
}

/// Drop the runtime installed on this thread, releasing every live handle
/// and pending callback.
pub fn teardown() {
    RUNTIME.with(|slot| slot.borrow_mut().take());
}

/// Run `f` against the installed runtime, or return `None` when no runtime
/// is installed.
pub(crate) fn with<R>(f: impl FnOnce(&mut VpiRuntime) -> R) -> Option<R> {
    RUNTIME.with(|slot| slot.borrow_mut().as_mut().map(f))
}

/// Dispatch PLI-error callbacks and apply the fatal policy for a raise that
/// happened during the call that just released its borrow.
pub(crate) fn run_error_hooks() {
    let pending = with(|rt| std::mem::take(&mut rt.error_pending)).unwrap_or(false);
    if !pending {
        return;
    }
    dispatch_reason(CbReason::Error);
    let escalate = with(|rt| {
        let severity = rt.error.severity()?;
        if severity < Severity::Error || !rt.model.fatal_on_vpi_error() {
            return None;
        }
        let record = rt.error.record()?;
        Some((
            record.file.to_string_lossy().into_owned(),
            record.line,
            record.message.to_string_lossy().into_owned(),
        ))
    })
    .flatten();
    if let Some((file, line, message)) = escalate {
        with(|rt| rt.model.fatal(&file, line, &message));
    }
}

/// Invoke every callback registered under `reason`, tolerating registry
/// mutation from inside the callbacks. Returns the number invoked.
pub fn call_cbs(reason: CbReason) -> usize {
    debug!(?reason, "callback dispatch pass");
    dispatch_reason(reason)
}

fn dispatch_reason(reason: CbReason) -> usize {
    let ids = with(|rt| rt.callbacks.snapshot(reason)).unwrap_or_default();
    let mut invoked = 0;
    for id in ids {
        // Re-check liveness each step: an earlier callback may have removed
        // this registration.
        let invocation = with(|rt| rt.plain_invocation(id)).flatten();
        if let Some(invocation) = invocation {
            fire(invocation);
            invoked += 1;
        }
    }
    invoked
}

/// Pop and invoke every after-delay callback whose deadline has been
/// reached. Returns the number invoked.
pub fn call_timed_cbs() -> usize {
    let mut invoked = 0;
    loop {
        let invocation = with(|rt| {
            let now = rt.model.time();
            let callback = rt.callbacks.pop_due(now)?;
            Some(rt.invocation_of(&callback, None))
        })
        .flatten();
        let Some(invocation) = invocation else {
            break;
        };
        fire(invocation);
        invoked += 1;
        run_error_hooks();
    }
    invoked
}

/// Compare every value-change registration's shadow against storage and
/// invoke the changed ones. Returns the number invoked.
pub fn call_value_change_cbs() -> usize {
    let ids = with(|rt| rt.callbacks.snapshot(CbReason::ValueChange)).unwrap_or_default();
    let mut invoked = 0;
    for id in ids {
        let invocation = with(|rt| rt.value_change_invocation(id)).flatten();
        if let Some(invocation) = invocation {
            fire(invocation);
            invoked += 1;
        }
        run_error_hooks();
    }
    invoked
}

/// Earliest pending after-delay deadline, if any.
#[must_use]
pub fn next_deadline() -> Option<u64> {
    with(|rt| rt.callbacks.next_deadline()).flatten()
}

/// One foreign call, fully resolved while the runtime was borrowed.
pub(crate) struct Invocation {
    routine: CbRoutine,
    reason: CbReason,
    obj: u64,
    user_data: *mut c_char,
    time: Option<u64>,
    value: Option<(ValueFormat, Rendered)>,
}

/// Call the foreign routine with a data block assembled on this stack frame.
/// The value and time pointers are valid for the duration of the call only.
fn fire(invocation: Invocation) {
    let mut time = VpiTime {
        type_: TimeType::Sim as i32,
        high: 0,
        low: 0,
        real: 0.0,
    };
    let time_ptr = match invocation.time {
        Some(now) => {
            time.high = (now >> 32) as u32;
            time.low = now as u32;
            &mut time as *mut VpiTime
        }
        None => std::ptr::null_mut(),
    };

    // Keep rendered payloads alive across the call.
    let mut text = Vec::new();
    let mut lanes: Vec<Lane> = Vec::new();
    let mut value = VpiValue {
        format: ValueFormat::Suppress as i32,
        value: ValueUnion { integer: 0 },
    };
    let value_ptr = match invocation.value {
        Some((format, rendered)) => {
            value.format = format as i32;
            match rendered {
                Rendered::Int(i) => value.value.integer = i,
                Rendered::Lanes(l) => {
                    lanes = l;
                    value.value.vector = lanes.as_mut_ptr();
                }
                Rendered::Text { bytes, .. } => {
                    text = bytes;
                    text.push(0);
                    value.value.str_ = text.as_mut_ptr().cast::<c_char>();
                }
            }
            &mut value as *mut VpiValue
        }
        None => std::ptr::null_mut(),
    };

    let mut data = CbData {
        reason: invocation.reason as i32,
        cb_rtn: Some(invocation.routine),
        obj: invocation.obj as usize as RawHandle,
        time: time_ptr,
        value: value_ptr,
        index: 0,
        user_data: invocation.user_data,
    };
    (invocation.routine)(&mut data);
}

/// Decoded `vpi_register_cb` arguments.
pub(crate) struct CbRequest {
    pub reason: i32,
    pub routine: Option<CbRoutine>,
    pub obj: Option<Handle>,
    pub time: Option<(TimeType, u64)>,
    pub value_format: Option<i32>,
    pub user_data: *mut c_char,
}

bitflags::bitflags! {
    /// Console channels of the multi-channel descriptor. File channels are
    /// allocated from the bits above these.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct McdChannels: u32 {
        const STDOUT = 1;
        const STDERR = 1 << 1;
    }
}

const MCD_FILE_BITS: usize = 30;

/// Maps multi-channel descriptor bits to native file handles.
#[derive(Debug, Default)]
struct McdTable {
    files: Vec<Option<File>>,
}

impl McdTable {
    /// Open `path` for writing and allocate a channel bit for it.
    fn open(&mut self, path: &str) -> u32 {
        let slot = match self.files.iter().position(Option::is_none) {
            Some(slot) => slot,
            None if self.files.len() < MCD_FILE_BITS => {
                self.files.push(None);
                self.files.len() - 1
            }
            None => return 0,
        };
        match File::create(path) {
            Ok(file) => {
                self.files[slot] = Some(file);
                1 << (slot + 2)
            }
            Err(_) => 0,
        }
    }

    /// Write to every channel of `mcd`. Fails wholesale on a closed channel.
    fn write(&mut self, mcd: u32, bytes: &[u8]) -> Result<(), ()> {
        for bit in 0..32 {
            if mcd & (1 << bit) == 0 {
                continue;
            }
            match bit {
                0 => std::io::stdout().write_all(bytes).map_err(drop)?,
                1 => std::io::stderr().write_all(bytes).map_err(drop)?,
                _ => match self.files.get_mut(bit - 2).and_then(Option::as_mut) {
                    Some(file) => file.write_all(bytes).map_err(drop)?,
                    None => return Err(()),
                },
            }
        }
        Ok(())
    }

    fn flush(&mut self, mcd: u32) -> Result<(), ()> {
        for bit in 0..32 {
            if mcd & (1 << bit) == 0 {
                continue;
            }
            match bit {
                0 => std::io::stdout().flush().map_err(drop)?,
                1 => std::io::stderr().flush().map_err(drop)?,
                _ => match self.files.get_mut(bit - 2).and_then(Option::as_mut) {
                    Some(file) => file.flush().map_err(drop)?,
                    None => return Err(()),
                },
            }
        }
        Ok(())
    }

    /// Close the file channels of `mcd`; console bits cannot be closed.
    fn close(&mut self, mcd: u32) -> Result<(), ()> {
        if McdChannels::from_bits_truncate(mcd).intersects(McdChannels::all()) {
            return Err(());
        }
        let mut closed_any = false;
        for bit in 2..32 {
            if mcd & (1u32 << bit) == 0 {
                continue;
            }
            match self.files.get_mut(bit - 2) {
                Some(slot @ Some(_)) => {
                    *slot = None;
                    closed_any = true;
                }
                _ => return Err(()),
            }
        }
        if closed_any { Ok(()) } else { Err(()) }
    }
}

pub(crate) struct VpiRuntime {
    model: Box<dyn SimulatorModel>,
    design: Design,
    pub(crate) handles: HandleTable,
    callbacks: CallbackRegistry,
    pub(crate) error: ErrorSlot,
    error_pending: bool,
    mcd: McdTable,
    /// Command line marshalled once for `vpi_get_vlog_info`; `argv` points
    /// into `args` and stays valid for the runtime's lifetime.
    args: Vec<CString>,
    argv: Vec<*mut c_char>,
    product: CString,
    version: CString,
}

impl VpiRuntime {
    fn new(model: Box<dyn SimulatorModel>, design: Design) -> Self {
        let args: Vec<CString> = model
            .command_args()
            .iter()
            .map(|a| CString::new(a.as_str()).unwrap_or_default())
            .collect();
        let mut argv: Vec<*mut c_char> = args
            .iter()
            .map(|a| a.as_ptr().cast_mut())
            .collect();
        argv.push(std::ptr::null_mut());
        let product = CString::new(model.product_name()).unwrap_or_default();
        let version = CString::new(model.product_version()).unwrap_or_default();
        Self {
            model,
            design,
            handles: HandleTable::new(),
            callbacks: CallbackRegistry::default(),
            error: ErrorSlot::default(),
            error_pending: false,
            mcd: McdTable::default(),
            args,
            argv,
            product,
            version,
        }
    }

    /// Record into the error slot, capturing the raise site. Error-callback
    /// dispatch and fatal escalation run once the current borrow is
    /// released.
    pub(crate) fn raise(
        &mut self,
        severity: Severity,
        file: &'static str,
        line: u32,
        args: fmt::Arguments<'_>,
    ) {
        let message = fmt::format(args);
        debug!(?severity, %message, "vpi error recorded");
        let product = self.model.product_name().to_string();
        self.error.set(severity, file, line, &product, &message);
        self.error_pending = true;
    }

    fn variable(&self, var: VarRef) -> Option<&Variable> {
        self.design.scope(var.scope)?.var(var.var)
    }

    fn access(&self, var: VarRef, byte_offset: usize) -> Option<Access> {
        let v = self.variable(var)?;
        // SAFETY: `byte_offset` was derived from a bounds-checked element
        // index, so the offset pointer stays inside the storage the
        // StoragePtr contract covers.
        let ptr = unsafe { v.storage.as_ptr().add(byte_offset) };
        Some(Access {
            kind: v.kind,
            bits: v.bits,
            stride: v.stride,
            mask: var.mask,
            ptr,
        })
    }

    // --- name and hierarchy resolution -----------------------------------

    pub(crate) fn handle_by_name(&mut self, name: &str, scope: Option<Handle>) -> Option<Handle> {
        trace!(name, "vpi_handle_by_name");
        let prefixed;
        let full = match scope {
            Some(h) => match self.handles.get(h) {
                Some(&HandleObject::Scope { scope }) => {
                    prefixed = format!("{}.{}", self.design.scope(scope)?.name(), name);
                    prefixed.as_str()
                }
                _ => {
                    raise_warning!(self, "vpi_handle_by_name: scope argument is not a scope");
                    return None;
                }
            },
            None => name,
        };
        if let Some(scope) = self.design.scope_index(full) {
            return Some(self.handles.alloc(HandleObject::Scope { scope }));
        }
        let (scope_name, var_name) = full.rsplit_once('.')?;
        let scope = self.design.scope_index(scope_name)?;
        let var = self.design.scope(scope)?.var_index(var_name)?;
        let mask = self.design.scope(scope)?.var(var)?.mask();
        Some(self.handles.alloc(HandleObject::Var(VarRef { scope, var, mask })))
    }

    pub(crate) fn handle_by_index(&mut self, handle: Handle, index: i32) -> Option<Handle> {
        let Some(var) = self.handles.get(handle).and_then(HandleObject::as_var).copied() else {
            raise_warning!(self, "vpi_handle_by_index: handle is not a variable");
            return None;
        };
        let v = self.variable(var)?;
        if v.dims != 2 {
            let name = v.name.clone();
            raise_warning!(self, "vpi_handle_by_index: {name} is not an unpacked array");
            return None;
        }
        let offset = v.index_offset(index)?;
        let byte_offset = offset * v.stride;
        Some(self.handles.alloc(HandleObject::Word {
            var,
            index,
            byte_offset,
        }))
    }

    pub(crate) fn handle_rel(&mut self, rel: i32, handle: Handle) -> Option<Handle> {
        let Ok(method) = Method::try_from(rel) else {
            raise_warning!(self, "vpi_handle: unsupported relation {rel}");
            return None;
        };
        let endpoints = match self.handles.get(handle)? {
            &HandleObject::Var(var) => {
                let v = self.variable(var)?;
                (v.lhs, v.rhs)
            }
            &HandleObject::Word { var, .. } => {
                let v = self.variable(var)?;
                (v.bits as i32 - 1, 0)
            }
            &HandleObject::Range { lhs, rhs, .. } => (lhs, rhs),
            _ => {
                raise_warning!(self, "vpi_handle: relation {method:?} unsupported for this object");
                return None;
            }
        };
        let value = match method {
            Method::LeftRange => endpoints.0,
            Method::RightRange => endpoints.1,
        };
        Some(self.handles.alloc(HandleObject::Const { value }))
    }

    pub(crate) fn iterate(&mut self, kind: i32, handle: Option<Handle>) -> Option<Handle> {
        let object = handle.and_then(|h| self.handles.get(h));
        match ObjectType::try_from(kind) {
            Ok(ObjectType::MemoryWord) => {
                let Some(&HandleObject::Var(var)) = object else {
                    raise_warning!(self, "vpi_iterate: memory word iteration needs a memory");
                    return None;
                };
                let v = self.variable(var)?;
                if v.dims != 2 {
                    return None;
                }
                let (lhs, rhs) = (v.lhs, v.rhs);
                Some(self.handles.alloc(HandleObject::WordIter {
                    var,
                    next: Some(lhs),
                    last: rhs,
                }))
            }
            Ok(ObjectType::Reg) => {
                let Some(&HandleObject::Scope { scope }) = object else {
                    raise_warning!(self, "vpi_iterate: variable iteration needs a scope");
                    return None;
                };
                Some(self.handles.alloc(HandleObject::VarIter { scope, pos: 0 }))
            }
            Ok(ObjectType::Range) => {
                let Some(&HandleObject::Var(var)) = object else {
                    raise_warning!(self, "vpi_iterate: range iteration needs a variable");
                    return None;
                };
                let v = self.variable(var)?;
                if v.dims != 2 {
                    return None;
                }
                Some(self.handles.alloc(HandleObject::Range {
                    lhs: v.lhs,
                    rhs: v.rhs,
                    scanned: false,
                }))
            }
            _ => {
                raise_warning!(self, "vpi_iterate: unsupported iteration kind {kind}");
                None
            }
        }
    }

    /// Advance an iterator handle. A drained iterator is released, per the
    /// standard's `vpi_scan` contract.
    pub(crate) fn scan(&mut self, handle: Handle) -> Option<Handle> {
        match self.handles.get(handle) {
            Some(&HandleObject::VarIter { scope, pos }) => {
                let Some(v) = self.design.scope(scope).and_then(|s| s.var(pos)) else {
                    self.handles.release(handle);
                    return None;
                };
                let mask = v.mask();
                if let Some(HandleObject::VarIter { pos, .. }) = self.handles.get_mut(handle) {
                    *pos += 1;
                }
                Some(self.handles.alloc(HandleObject::Var(VarRef {
                    scope,
                    var: pos,
                    mask,
                })))
            }
            Some(&HandleObject::WordIter { var, next, last }) => {
                let Some(index) = next else {
                    self.handles.release(handle);
                    return None;
                };
                let v = self.variable(var)?;
                let byte_offset = v.index_offset(index)? * v.stride;
                let step = if v.lhs >= v.rhs { -1 } else { 1 };
                let following = (index != last).then(|| index + step);
                if let Some(HandleObject::WordIter { next, .. }) = self.handles.get_mut(handle) {
                    *next = following;
                }
                Some(self.handles.alloc(HandleObject::Word {
                    var,
                    index,
                    byte_offset,
                }))
            }
            Some(&HandleObject::Range { lhs, rhs, scanned }) => {
                if scanned {
                    self.handles.release(handle);
                    return None;
                }
                if let Some(HandleObject::Range { scanned, .. }) = self.handles.get_mut(handle) {
                    *scanned = true;
                }
                Some(self.handles.alloc(HandleObject::Range {
                    lhs,
                    rhs,
                    scanned: true,
                }))
            }
            Some(_) => {
                raise_warning!(self, "vpi_scan: handle is not an iterator");
                None
            }
            None => None,
        }
    }

    // --- property getters ------------------------------------------------

    pub(crate) fn get_int(&mut self, property: i32, handle: Option<Handle>) -> i32 {
        let Ok(property) = Property::try_from(property) else {
            raise_warning!(self, "vpi_get: unsupported property {property}");
            return UNDEFINED;
        };
        if property == Property::TimePrecision {
            return self.model.time_precision();
        }
        let object = match handle.and_then(|h| self.handles.get(h)) {
            Some(object) => object.clone(),
            None => {
                raise_warning!(self, "vpi_get: invalid handle for property {property:?}");
                return UNDEFINED;
            }
        };
        match (property, &object) {
            (Property::Type, object) => self.object_type(object) as i32,
            (Property::Size, &HandleObject::Var(var)) => match self.variable(var) {
                Some(v) if v.dims == 2 => v.elements() as i32,
                Some(v) => v.bits as i32,
                None => UNDEFINED,
            },
            (Property::Size, &HandleObject::Word { var, .. }) => self
                .variable(var)
                .map_or(UNDEFINED, |v| v.bits as i32),
            (Property::Size, &HandleObject::Range { lhs, rhs, .. }) => {
                (lhs.abs_diff(rhs) + 1) as i32
            }
            (Property::Vector, object) => match self.object_bits(object) {
                Some(bits) => i32::from(bits > 1),
                None => UNDEFINED,
            },
            (Property::Scalar, object) => match self.object_bits(object) {
                Some(bits) => i32::from(bits == 1),
                None => UNDEFINED,
            },
            (Property::Direction, object) => match object.as_value_target() {
                Some((var, _)) => self
                    .variable(var)
                    .map_or(UNDEFINED, |v| v.direction as i32),
                None => UNDEFINED,
            },
            _ => {
                raise_warning!(self, "vpi_get: unsupported property {property:?} for this object");
                UNDEFINED
            }
        }
    }

    fn object_type(&self, object: &HandleObject) -> ObjectType {
        match object {
            HandleObject::Scope { .. } => ObjectType::Scope,
            HandleObject::Var(var) => match self.variable(*var) {
                Some(v) if v.dims == 2 => ObjectType::Memory,
                _ => ObjectType::Reg,
            },
            HandleObject::Word { .. } => ObjectType::MemoryWord,
            HandleObject::Const { .. } => ObjectType::Constant,
            HandleObject::Range { .. } => ObjectType::Range,
            HandleObject::VarIter { .. } | HandleObject::WordIter { .. } => ObjectType::Iterator,
            HandleObject::Callback { .. } => ObjectType::Callback,
        }
    }

    fn object_bits(&self, object: &HandleObject) -> Option<u32> {
        let (var, _) = object.as_value_target()?;
        self.variable(var).map(|v| v.bits)
    }

    pub(crate) fn get_str(&mut self, property: i32, handle: Option<Handle>) -> Option<String> {
        let Ok(property) = Property::try_from(property) else {
            raise_warning!(self, "vpi_get_str: unsupported property {property}");
            return None;
        };
        let object = match handle.and_then(|h| self.handles.get(h)) {
            Some(object) => object.clone(),
            None => {
                raise_warning!(self, "vpi_get_str: invalid handle for property {property:?}");
                return None;
            }
        };
        let rendered = match (property, &object) {
            (Property::Name | Property::FullName, &HandleObject::Scope { scope }) => {
                Some(self.design.scope(scope)?.name().to_string())
            }
            (Property::Name, &HandleObject::Var(var)) => {
                Some(self.variable(var)?.name.clone())
            }
            (Property::Name, &HandleObject::Word { var, index, .. }) => {
                Some(format!("{}[{index}]", self.variable(var)?.name))
            }
            (Property::FullName, &HandleObject::Var(var)) => self.full_name(var, None),
            (Property::FullName, &HandleObject::Word { var, index, .. }) => {
                self.full_name(var, Some(index))
            }
            _ => None,
        };
        if rendered.is_none() {
            raise_warning!(
                self,
                "vpi_get_str: unsupported property {property:?} for this object"
            );
        }
        rendered
    }

    fn full_name(&self, var: VarRef, index: Option<i32>) -> Option<String> {
        let scope = self.design.scope(var.scope)?;
        let v = scope.var(var.var)?;
        Some(match index {
            Some(index) => format!("{}.{}[{index}]", scope.name(), v.name),
            None => format!("{}.{}", scope.name(), v.name),
        })
    }

    // --- value access ----------------------------------------------------

    /// Resolve a value-bearing handle, rejecting whole-memory access.
    fn value_access(&mut self, handle: Handle, entry: &'static str) -> Option<Access> {
        let Some(object) = self.handles.get(handle) else {
            raise_warning!(self, "{entry}: invalid handle");
            return None;
        };
        let Some((var, byte_offset)) = object.as_value_target() else {
            raise_warning!(self, "{entry}: handle does not carry a value");
            return None;
        };
        let v = self.variable(var)?;
        if v.dims == 2 && matches!(object, HandleObject::Var(_)) {
            let name = v.name.clone();
            raise_warning!(self, "{entry}: memory {name} needs a word select");
            return None;
        }
        self.access(var, byte_offset)
    }

    pub(crate) fn get_value(&mut self, handle: Handle, format: i32) -> Option<Rendered> {
        let Ok(format) = ValueFormat::try_from(format) else {
            raise_error!(self, "vpi_get_value: unsupported format {format}");
            return None;
        };
        if let Some(&HandleObject::Const { value }) = self.handles.get(handle) {
            if format == ValueFormat::Int {
                return Some(Rendered::Int(value));
            }
            raise_error!(self, "vpi_get_value: unsupported format {format:?} for a constant");
            return None;
        }
        let access = self.value_access(handle, "vpi_get_value")?;
        match value::read_value(&access, format) {
            Ok(rendered) => {
                if let Rendered::Text { truncated: true, .. } = &rendered {
                    raise_warning!(self, "vpi_get_value: {}", value::Error::Truncated {
                        bits: access.bits,
                        cap: value::TEXT_CAP,
                    });
                }
                Some(rendered)
            }
            Err(overflow @ value::Error::LaneOverflow { .. }) => {
                let message = overflow.to_string();
                self.model.fatal(file!(), line!(), &message)
            }
            Err(err) => {
                raise_error!(self, "vpi_get_value: {err}");
                None
            }
        }
    }

    pub(crate) fn put_value(&mut self, handle: Handle, format: i32, input: WriteInput<'_>) {
        let Ok(format) = ValueFormat::try_from(format) else {
            raise_error!(self, "vpi_put_value: unsupported format {format}");
            return;
        };
        let Some(object) = self.handles.get(handle) else {
            raise_warning!(self, "vpi_put_value: invalid handle");
            return;
        };
        if let Some((var, _)) = object.as_value_target() {
            let writable = self.variable(var).is_some_and(|v| v.writable);
            if !writable {
                let name = self.full_name(var, None).unwrap_or_default();
                raise_warning!(self, "vpi_put_value: signal {name} is marked read-only");
                return;
            }
        }
        let Some(mut access) = self.value_access(handle, "vpi_put_value") else {
            return;
        };
        match value::write_value(&mut access, format, input) {
            Ok(None) => {}
            Ok(Some(warning)) => raise_warning!(self, "vpi_put_value: {warning}"),
            Err(err @ value::Error::Unsupported(..)) => {
                raise_error!(self, "vpi_put_value: {err}");
            }
            Err(err) => raise_warning!(self, "vpi_put_value: {err}"),
        }
    }

    // --- callbacks -------------------------------------------------------

    pub(crate) fn register_cb(&mut self, request: CbRequest) -> Option<Handle> {
        let Ok(reason) = CbReason::try_from(request.reason) else {
            raise_warning!(
                self,
                "vpi_register_cb: unsupported callback reason {}",
                request.reason
            );
            return None;
        };
        let Some(routine) = request.routine else {
            raise_warning!(self, "vpi_register_cb: callback routine is null");
            return None;
        };
        trace!(?reason, "vpi_register_cb");
        let wants_time = matches!(request.time, Some((t, _)) if t != TimeType::Suppress);
        let value_format = match request.value_format {
            None => None,
            Some(raw) => match ValueFormat::try_from(raw) {
                Ok(ValueFormat::Suppress) => None,
                Ok(format) => Some(format),
                Err(_) => {
                    raise_warning!(self, "vpi_register_cb: unsupported value format {raw}");
                    return None;
                }
            },
        };

        let mut callback = Callback {
            reason,
            routine,
            user_data: request.user_data,
            obj: request.obj,
            target: None,
            value_format,
            wants_time,
            shadow: Vec::new(),
            deadline: None,
        };
        match reason {
            CbReason::ValueChange => {
                let target = request
                    .obj
                    .and_then(|h| self.handles.get(h))
                    .and_then(HandleObject::as_value_target);
                let Some((var, byte_offset)) = target else {
                    raise_warning!(self, "vpi_register_cb: value change needs a variable");
                    return None;
                };
                let access = self.access(var, byte_offset)?;
                callback.target = Some((var, byte_offset));
                callback.shadow = access.snapshot();
            }
            CbReason::AfterDelay => {
                let Some((_, delay)) = request.time else {
                    raise_warning!(self, "vpi_register_cb: delay callback needs a time");
                    return None;
                };
                callback.deadline = Some(self.model.time().saturating_add(delay));
            }
            _ => {}
        }
        let cb = self.callbacks.register(callback);
        Some(self.handles.alloc(HandleObject::Callback { cb }))
    }

    pub(crate) fn remove_cb(&mut self, handle: Handle) -> i32 {
        match self.handles.get(handle) {
            Some(&HandleObject::Callback { cb }) => {
                self.callbacks.remove(cb);
                self.handles.release(handle);
                1
            }
            _ => 0,
        }
    }

    /// Release any handle; a callback handle also drops its registration.
    pub(crate) fn release_handle(&mut self, handle: Handle) -> i32 {
        match self.handles.release(handle) {
            Some(HandleObject::Callback { cb }) => {
                self.callbacks.remove(cb);
                1
            }
            Some(_) => 1,
            None => 0,
        }
    }

    /// Build the invocation for a reason-set callback, or `None` when the
    /// registration is gone.
    fn plain_invocation(&mut self, id: u64) -> Option<Invocation> {
        let callback = self.callbacks.get(id)?;
        Some(self.invocation_of(callback, None))
    }

    fn invocation_of(
        &self,
        callback: &Callback,
        value: Option<(ValueFormat, Rendered)>,
    ) -> Invocation {
        Invocation {
            routine: callback.routine,
            reason: callback.reason,
            obj: callback.obj.map_or(0, Handle::as_raw),
            user_data: callback.user_data,
            time: callback.wants_time.then(|| self.model.time()),
            value,
        }
    }

    /// Compare one value-change registration against storage; on a change,
    /// refresh the shadow and build the invocation.
    fn value_change_invocation(&mut self, id: u64) -> Option<Invocation> {
        let (target, format) = {
            let callback = self.callbacks.get(id)?;
            (callback.target?, callback.value_format)
        };
        let access = self.access(target.0, target.1)?;
        let current = access.snapshot();
        {
            let callback = self.callbacks.get_mut(id)?;
            if callback.shadow == current {
                return None;
            }
            callback.shadow = current;
        }
        let value = match format {
            Some(format) => match value::read_value(&access, format) {
                Ok(rendered) => Some((format, rendered)),
                Err(err) => {
                    raise_error!(self, "value change callback: {err}");
                    return None;
                }
            },
            None => None,
        };
        let callback = self.callbacks.get(id)?;
        Some(self.invocation_of(callback, value))
    }

    // --- control and metadata --------------------------------------------

    pub(crate) fn control(&mut self, operation: i32) -> i32 {
        match ControlOp::try_from(operation) {
            Ok(ControlOp::Finish) => {
                self.model.request_finish("*VPI*", 0);
                1
            }
            Ok(ControlOp::Stop) => {
                self.model.request_stop("*VPI*", 0);
                1
            }
            Err(_) => {
                raise_warning!(self, "vpi_control: unsupported operation {operation}");
                0
            }
        }
    }

    pub(crate) fn time_now(&self) -> u64 {
        self.model.time()
    }

    /// Lane count of a value-bearing handle's element, for sizing the caller
    /// side of a vector write.
    pub(crate) fn vector_words(&self, handle: Handle) -> Option<usize> {
        let (var, _) = self.handles.get(handle)?.as_value_target()?;
        let v = self.variable(var)?;
        Some(v.bits.div_ceil(32).max(1) as usize)
    }

    pub(crate) fn vlog_info(&mut self) -> (i32, *mut *mut c_char, *mut c_char, *mut c_char) {
        (
            self.args.len() as i32,
            self.argv.as_mut_ptr(),
            self.product.as_ptr().cast_mut(),
            self.version.as_ptr().cast_mut(),
        )
    }

    pub(crate) fn compare(&self, a: Handle, b: Handle) -> bool {
        let (Some(a), Some(b)) = (self.handles.get(a), self.handles.get(b)) else {
            return false;
        };
        match (a, b) {
            (HandleObject::Scope { scope: a }, HandleObject::Scope { scope: b }) => a == b,
            (HandleObject::Var(a), HandleObject::Var(b)) => {
                a.scope == b.scope && a.var == b.var
            }
            (
                HandleObject::Word { var: a, index: ia, .. },
                HandleObject::Word { var: b, index: ib, .. },
            ) => a.scope == b.scope && a.var == b.var && ia == ib,
            (HandleObject::Const { value: a }, HandleObject::Const { value: b }) => a == b,
            (
                HandleObject::Range { lhs: la, rhs: ra, .. },
                HandleObject::Range { lhs: lb, rhs: rb, .. },
            ) => la == lb && ra == rb,
            _ => false,
        }
    }

    pub(crate) fn mcd_open(&mut self, path: &str) -> u32 {
        let mcd = self.mcd.open(path);
        if mcd == 0 {
            raise_warning!(self, "vpi_mcd_open: cannot open {path}");
        }
        mcd
    }

    pub(crate) fn mcd_write(&mut self, mcd: u32, bytes: &[u8]) -> i32 {
        match self.mcd.write(mcd, bytes) {
            Ok(()) => bytes.len() as i32,
            Err(()) => {
                raise_warning!(self, "vpi_mcd_printf: descriptor {mcd:#x} has a closed channel");
                0
            }
        }
    }

    pub(crate) fn mcd_flush(&mut self, mcd: u32) -> u32 {
        u32::from(self.mcd.flush(mcd).is_err())
    }

    pub(crate) fn mcd_close(&mut self, mcd: u32) -> u32 {
        match self.mcd.close(mcd) {
            Ok(()) => 0,
            Err(()) => {
                raise_warning!(self, "vpi_mcd_close: invalid descriptor {mcd:#x}");
                mcd
            }
        }
    }

    /// Flush the console channels and the model's own output.
    pub(crate) fn flush_all(&mut self) -> i32 {
        let failed = self.mcd.flush(McdChannels::all().bits()).is_err();
        self.model.flush();
        i32::from(failed)
    }
}
