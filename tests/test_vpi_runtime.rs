//! Drives the runtime the way a PLI application would: through the C-ABI
//! entry points, against a small fixture design.

use std::cell::{Cell, RefCell};
use std::ffi::{CStr, CString};
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use pretty_assertions::assert_eq;
use vpi_runtime::ffi::{self, CbData, RawHandle, ValueUnion, VlogInfo, VpiTime, VpiValue};
use vpi_runtime::schema::objects::{Method, ObjectType};
use vpi_runtime::schema::values::{
    ControlOp, Direction, Property, Severity, TimeType, UNDEFINED, ValueFormat,
};
use vpi_runtime::{
    CbReason, Design, Scope, SimulatorModel, StoragePtr, VarKind, Variable,
};

#[derive(Default)]
struct ModelState {
    time: u64,
    finish: Option<String>,
    stop: Option<String>,
    fatal_on_error: bool,
}

struct TestModel {
    state: Rc<RefCell<ModelState>>,
    args: Vec<String>,
}

impl SimulatorModel for TestModel {
    fn time(&self) -> u64 {
        self.state.borrow().time
    }

    fn time_precision(&self) -> i32 {
        -12
    }

    fn product_name(&self) -> &str {
        "simrt"
    }

    fn product_version(&self) -> &str {
        "0.1.0"
    }

    fn command_args(&self) -> &[String] {
        &self.args
    }

    fn got_finish(&self) -> bool {
        self.state.borrow().finish.is_some()
    }

    fn request_finish(&mut self, file: &str, line: u32) {
        self.state.borrow_mut().finish = Some(format!("{file}:{line}"));
    }

    fn request_stop(&mut self, file: &str, line: u32) {
        self.state.borrow_mut().stop = Some(format!("{file}:{line}"));
    }

    fn fatal_on_vpi_error(&self) -> bool {
        self.state.borrow().fatal_on_error
    }

    fn flush(&mut self) {}

    fn fatal(&mut self, file: &str, line: u32, msg: &str) -> ! {
        panic!("fatal at {file}:{line}: {msg}");
    }
}

/// The fixture design. `Cell` storage keeps direct mutation from the test
/// body legal alongside the raw pointers the runtime holds.
struct Bench {
    state: Rc<RefCell<ModelState>>,
    onebit: Box<Cell<u8>>,
    twoone: Box<Cell<u8>>,
    byte8: Box<Cell<u8>>,
    ro8: Box<Cell<u8>>,
    count16: Box<Cell<u16>>,
    quad: Box<Cell<u64>>,
    wide: Box<[Cell<u32>; 3]>,
    mem0: Box<[Cell<u32>; 16]>,
}

fn var(
    name: &str,
    kind: VarKind,
    bits: u32,
    dims: u8,
    (lhs, rhs): (i32, i32),
    direction: Direction,
    writable: bool,
    ptr: *mut u8,
) -> Variable {
    Variable {
        name: name.into(),
        kind,
        bits,
        dims,
        lhs,
        rhs,
        stride: kind.stride(bits),
        direction,
        writable,
        // SAFETY: the Bench owns the pointed-to Cell storage and outlives
        // every test's use of the installed runtime.
        storage: unsafe { StoragePtr::new(ptr) },
    }
}

impl Bench {
    fn install() -> Self {
        let state = Rc::new(RefCell::new(ModelState::default()));
        let bench = Self {
            state: state.clone(),
            onebit: Box::new(Cell::new(0)),
            twoone: Box::new(Cell::new(0)),
            byte8: Box::new(Cell::new(0)),
            ro8: Box::new(Cell::new(0)),
            count16: Box::new(Cell::new(0)),
            quad: Box::new(Cell::new(0)),
            wide: Box::new([const { Cell::new(0) }; 3]),
            mem0: Box::new([const { Cell::new(0) }; 16]),
        };

        let mut t = Scope::new("t");
        t.add_var(var(
            "onebit",
            VarKind::U8,
            1,
            0,
            (0, 0),
            Direction::Output,
            true,
            bench.onebit.as_ptr(),
        ));
        t.add_var(var(
            "twoone",
            VarKind::U8,
            2,
            1,
            (1, 0),
            Direction::Input,
            true,
            bench.twoone.as_ptr(),
        ));
        t.add_var(var(
            "byte8",
            VarKind::U8,
            8,
            1,
            (7, 0),
            Direction::NoDirection,
            true,
            bench.byte8.as_ptr(),
        ));
        t.add_var(var(
            "ro8",
            VarKind::U8,
            8,
            1,
            (7, 0),
            Direction::NoDirection,
            false,
            bench.ro8.as_ptr(),
        ));
        t.add_var(var(
            "count16",
            VarKind::U16,
            16,
            1,
            (15, 0),
            Direction::NoDirection,
            true,
            bench.count16.as_ptr().cast(),
        ));
        t.add_var(var(
            "quad",
            VarKind::U64,
            40,
            1,
            (39, 0),
            Direction::NoDirection,
            true,
            bench.quad.as_ptr().cast(),
        ));
        t.add_var(var(
            "wide",
            VarKind::Wide,
            70,
            1,
            (69, 0),
            Direction::NoDirection,
            true,
            bench.wide.as_ptr().cast_mut().cast(),
        ));
        t.add_var(var(
            "mem0",
            VarKind::U32,
            32,
            2,
            (16, 1),
            Direction::NoDirection,
            true,
            bench.mem0.as_ptr().cast_mut().cast(),
        ));

        let mut sub = Scope::new("t.sub");
        sub.add_var(var(
            "leaf",
            VarKind::U8,
            1,
            0,
            (0, 0),
            Direction::NoDirection,
            true,
            bench.onebit.as_ptr(),
        ));

        let mut design = Design::new();
        design.add_scope(t);
        design.add_scope(sub);
        vpi_runtime::install(
            Box::new(TestModel {
                state,
                args: vec!["+sim".into(), "test".into()],
            }),
            design,
        );
        bench
    }

    fn set_time(&self, time: u64) {
        self.state.borrow_mut().time = time;
    }
}

fn by_name(name: &str) -> RawHandle {
    let name = CString::new(name).unwrap();
    unsafe { ffi::vpi_handle_by_name(name.as_ptr(), std::ptr::null_mut()) }
}

fn get(property: Property, handle: RawHandle) -> i32 {
    unsafe { ffi::vpi_get(property as i32, handle) }
}

fn get_str(property: Property, handle: RawHandle) -> String {
    let text = unsafe { ffi::vpi_get_str(property as i32, handle) };
    assert!(!text.is_null());
    unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
}

fn get_int(handle: RawHandle) -> i32 {
    let mut value = VpiValue {
        format: ValueFormat::Int as i32,
        value: ValueUnion { integer: 0 },
    };
    unsafe {
        ffi::vpi_get_value(handle, &mut value);
        value.value.integer
    }
}

fn put_int(handle: RawHandle, integer: i32) {
    let mut value = VpiValue {
        format: ValueFormat::Int as i32,
        value: ValueUnion { integer },
    };
    unsafe {
        ffi::vpi_put_value(handle, &mut value, std::ptr::null_mut(), 0);
    }
}

fn get_text(handle: RawHandle, format: ValueFormat) -> String {
    let mut value = VpiValue {
        format: format as i32,
        value: ValueUnion { integer: 0 },
    };
    unsafe {
        ffi::vpi_get_value(handle, &mut value);
        let text = value.value.str_;
        assert!(!text.is_null());
        CStr::from_ptr(text).to_string_lossy().into_owned()
    }
}

fn put_text(handle: RawHandle, format: ValueFormat, text: &str) {
    let text = CString::new(text).unwrap();
    let mut value = VpiValue {
        format: format as i32,
        value: ValueUnion {
            str_: text.as_ptr().cast_mut(),
        },
    };
    unsafe {
        ffi::vpi_put_value(handle, &mut value, std::ptr::null_mut(), 0);
    }
}

fn error_level() -> i32 {
    unsafe { ffi::vpi_chk_error(std::ptr::null_mut()) }
}

fn scan_all(iterator: RawHandle) -> Vec<RawHandle> {
    let mut handles = Vec::new();
    loop {
        let handle = unsafe { ffi::vpi_scan(iterator) };
        if handle.is_null() {
            return handles;
        }
        handles.push(handle);
    }
}

fn sim_time(low: u32) -> VpiTime {
    VpiTime {
        type_: TimeType::Sim as i32,
        high: 0,
        low,
        real: 0.0,
    }
}

fn register(reason: CbReason, routine: ffi::CbRoutine, cb_data: &mut CbData) -> RawHandle {
    cb_data.reason = reason as i32;
    cb_data.cb_rtn = Some(routine);
    unsafe { ffi::vpi_register_cb(cb_data) }
}

fn empty_cb_data() -> CbData {
    CbData {
        reason: 0,
        cb_rtn: None,
        obj: std::ptr::null_mut(),
        time: std::ptr::null_mut(),
        value: std::ptr::null_mut(),
        index: 0,
        user_data: std::ptr::null_mut(),
    }
}

#[test]
fn test_properties_of_fixture_signals() {
    let _bench = Bench::install();

    let scope = by_name("t");
    assert!(!scope.is_null());
    assert_eq!(get(Property::Type, scope), ObjectType::Scope as i32);
    assert_eq!(get_str(Property::FullName, scope), "t");

    let onebit = by_name("t.onebit");
    assert!(!onebit.is_null());
    assert_eq!(get(Property::Type, onebit), ObjectType::Reg as i32);
    assert_eq!(get(Property::Size, onebit), 1);
    assert_eq!(get(Property::Vector, onebit), 0);
    assert_eq!(get(Property::Scalar, onebit), 1);
    assert_eq!(get(Property::Direction, onebit), Direction::Output as i32);
    assert_eq!(get_str(Property::Name, onebit), "onebit");
    assert_eq!(get_str(Property::FullName, onebit), "t.onebit");

    let twoone = by_name("t.twoone");
    assert_eq!(get(Property::Size, twoone), 2);
    assert_eq!(get(Property::Vector, twoone), 1);
    assert_eq!(get(Property::Scalar, twoone), 0);
    assert_eq!(get(Property::Direction, twoone), Direction::Input as i32);

    assert_eq!(get(Property::TimePrecision, std::ptr::null_mut()), -12);

    // Unknown name and unknown property are null/undefined.
    assert!(by_name("t.missing").is_null());
    assert!(by_name("nosuch.scope").is_null());
    assert_eq!(get(Property::TimeUnit, onebit), UNDEFINED);
    assert_eq!(error_level(), Severity::Warning as i32);
}

#[test]
fn test_scope_relative_lookup() {
    let _bench = Bench::install();
    let scope = by_name("t");
    let name = CString::new("onebit").unwrap();
    let onebit = unsafe { ffi::vpi_handle_by_name(name.as_ptr(), scope) };
    assert!(!onebit.is_null());
    assert_eq!(get_str(Property::FullName, onebit), "t.onebit");

    // A nested scope resolves as a scope first.
    let sub = by_name("t.sub");
    assert_eq!(get(Property::Type, sub), ObjectType::Scope as i32);
    let leaf = by_name("t.sub.leaf");
    assert_eq!(get_str(Property::FullName, leaf), "t.sub.leaf");
}

#[test]
fn test_variable_iteration_is_sorted() {
    let _bench = Bench::install();
    let scope = by_name("t");
    let iterator = unsafe { ffi::vpi_iterate(ObjectType::Reg as i32, scope) };
    assert!(!iterator.is_null());
    let names: Vec<String> = scan_all(iterator)
        .into_iter()
        .map(|h| get_str(Property::Name, h))
        .collect();
    assert_eq!(
        names,
        ["byte8", "count16", "mem0", "onebit", "quad", "ro8", "twoone", "wide"]
    );
    // The drained iterator was freed by the final scan.
    assert!(unsafe { ffi::vpi_scan(iterator) }.is_null());
}

#[test]
fn test_memory_words_and_ranges() {
    let bench = Bench::install();
    let mem0 = by_name("t.mem0");
    assert_eq!(get(Property::Type, mem0), ObjectType::Memory as i32);
    assert_eq!(get(Property::Size, mem0), 16);

    let left = unsafe { ffi::vpi_handle(Method::LeftRange as i32, mem0) };
    let right = unsafe { ffi::vpi_handle(Method::RightRange as i32, mem0) };
    assert_eq!(get(Property::Type, left), ObjectType::Constant as i32);
    assert_eq!(get_int(left), 16);
    assert_eq!(get_int(right), 1);

    let words = scan_all(unsafe { ffi::vpi_iterate(ObjectType::MemoryWord as i32, mem0) });
    assert_eq!(words.len(), 16);
    assert_eq!(get_str(Property::FullName, words[0]), "t.mem0[16]");
    assert_eq!(get_str(Property::FullName, words[15]), "t.mem0[1]");
    for word in &words {
        assert_eq!(get(Property::Type, *word), ObjectType::MemoryWord as i32);
        assert_eq!(get(Property::Size, *word), 32);
        let left = unsafe { ffi::vpi_handle(Method::LeftRange as i32, *word) };
        let right = unsafe { ffi::vpi_handle(Method::RightRange as i32, *word) };
        assert_eq!(get_int(left), 31);
        assert_eq!(get_int(right), 0);
    }

    // Write each word its own index through word handles, then re-read both
    // through fresh handles and the backing storage.
    for index in 1..=16 {
        let word = unsafe { ffi::vpi_handle_by_index(mem0, index) };
        assert!(!word.is_null());
        put_int(word, index);
    }
    for index in 1..=16 {
        let word = unsafe { ffi::vpi_handle_by_index(mem0, index) };
        assert_eq!(get_int(word), index);
        assert_eq!(bench.mem0[(index - 1) as usize].get(), index as u32);
    }
    assert!(unsafe { ffi::vpi_handle_by_index(mem0, 0) }.is_null());
    assert!(unsafe { ffi::vpi_handle_by_index(mem0, 17) }.is_null());

    // The range iterator is one-shot: one range object, then null.
    let ranges = scan_all(unsafe { ffi::vpi_iterate(ObjectType::Range as i32, mem0) });
    assert_eq!(ranges.len(), 1);
    assert_eq!(get(Property::Type, ranges[0]), ObjectType::Range as i32);
    let left = unsafe { ffi::vpi_handle(Method::LeftRange as i32, ranges[0]) };
    assert_eq!(get_int(left), 16);

    // Whole-memory value access needs a word select.
    put_int(mem0, 5);
    assert_eq!(error_level(), Severity::Warning as i32);
}

#[test]
fn test_int_write_masks_to_width() {
    let bench = Bench::install();
    let count16 = by_name("t.count16");
    put_int(count16, 0x15a5a);
    assert_eq!(get_int(count16), 0x5a5a);
    assert_eq!(bench.count16.get(), 0x5a5a);

    // IntVal is rejected on 64-bit and wide storage.
    let quad = by_name("t.quad");
    put_int(quad, 1);
    assert_eq!(error_level(), Severity::Error as i32);
    assert_eq!(bench.quad.get(), 0);
}

#[test]
fn test_decimal_write_reads_back_as_int() {
    let _bench = Bench::install();
    let count16 = by_name("t.count16");
    put_text(count16, ValueFormat::DecStr, "42");
    assert_eq!(get_int(count16), 42);
    assert_eq!(get_text(count16, ValueFormat::DecStr), "42");

    put_text(count16, ValueFormat::DecStr, "9 lives");
    assert_eq!(error_level(), Severity::Warning as i32);
    assert_eq!(get_int(count16), 9);
}

#[test]
fn test_hex_write_masks_and_warns_on_bad_digit() {
    let bench = Bench::install();
    let byte8 = by_name("t.byte8");
    put_text(byte8, ValueFormat::HexStr, "0x1ff");
    assert_eq!(bench.byte8.get(), 0xff);
    assert_eq!(get_text(byte8, ValueFormat::HexStr), "ff");

    put_text(byte8, ValueFormat::HexStr, "q7");
    assert_eq!(error_level(), Severity::Warning as i32);
    assert_eq!(bench.byte8.get(), 0x07);
}

#[test]
fn test_bin_str_round_trip_pads_left() {
    let _bench = Bench::install();
    let twoone = by_name("t.twoone");
    put_text(twoone, ValueFormat::BinStr, "10");
    assert_eq!(get_text(twoone, ValueFormat::BinStr), "10");
    put_text(twoone, ValueFormat::BinStr, "1");
    assert_eq!(get_text(twoone, ValueFormat::BinStr), "01");

    let wide = by_name("t.wide");
    let pattern: String = "10".repeat(35);
    put_text(wide, ValueFormat::BinStr, &pattern);
    assert_eq!(get_text(wide, ValueFormat::BinStr), pattern);
}

#[test]
fn test_string_value_reverses_bytes() {
    let bench = Bench::install();
    let quad = by_name("t.quad");
    put_text(quad, ValueFormat::String, "hello");
    // 40 bits is five bytes, stored in reverse order.
    assert_eq!(bench.quad.get(), u64::from_le_bytes(*b"olleh\0\0\0"));
    assert_eq!(get_text(quad, ValueFormat::String), "hello");

    put_text(quad, ValueFormat::String, "hi");
    assert_eq!(get_text(quad, ValueFormat::String), "   hi");
}

#[test]
fn test_read_only_write_is_rejected() {
    let bench = Bench::install();
    let ro8 = by_name("t.ro8");
    let mut value = VpiValue {
        format: ValueFormat::Int as i32,
        value: ValueUnion { integer: 0x5a },
    };
    let event =
        unsafe { ffi::vpi_put_value(ro8, &mut value, std::ptr::null_mut(), 0) };
    assert!(event.is_null());
    assert_eq!(error_level(), Severity::Warning as i32);
    assert_eq!(bench.ro8.get(), 0);
    // Reads still work.
    assert_eq!(get_int(ro8), 0);
}

#[test]
fn test_error_slot_resets_on_next_entry() {
    let _bench = Bench::install();
    let onebit = by_name("t.onebit");
    assert_eq!(get(Property::TimeUnit, onebit), UNDEFINED);
    assert_eq!(error_level(), Severity::Warning as i32);
    // chk_error itself does not reset.
    assert_eq!(error_level(), Severity::Warning as i32);
    // The next resetting entry clears the slot.
    assert_eq!(get(Property::Size, onebit), 1);
    assert_eq!(error_level(), 0);
}

#[test]
fn test_vlog_info_and_time() {
    let bench = Bench::install();
    let mut info = VlogInfo {
        argc: 0,
        argv: std::ptr::null_mut(),
        product: std::ptr::null_mut(),
        version: std::ptr::null_mut(),
    };
    assert_eq!(unsafe { ffi::vpi_get_vlog_info(&mut info) }, 1);
    assert_eq!(info.argc, 2);
    unsafe {
        assert_eq!(CStr::from_ptr(info.product).to_str(), Ok("simrt"));
        assert_eq!(CStr::from_ptr(info.version).to_str(), Ok("0.1.0"));
        assert_eq!(CStr::from_ptr(*info.argv).to_str(), Ok("+sim"));
        assert!((*info.argv.add(2)).is_null());
    }

    bench.set_time((3 << 32) | 7);
    let mut time = sim_time(0);
    unsafe { ffi::vpi_get_time(std::ptr::null_mut(), &mut time) };
    assert_eq!((time.high, time.low), (3, 7));

    let mut scaled = VpiTime {
        type_: TimeType::ScaledReal as i32,
        high: 0,
        low: 0,
        real: 0.0,
    };
    unsafe { ffi::vpi_get_time(std::ptr::null_mut(), &mut scaled) };
    assert_eq!(scaled.real, ((3u64 << 32) | 7) as f64);
}

#[test]
fn test_compare_release_and_reuse() {
    let _bench = Bench::install();
    let a = by_name("t.onebit");
    let b = by_name("t.onebit");
    let other = by_name("t.twoone");
    assert_ne!(a, b);
    assert_eq!(unsafe { ffi::vpi_compare_objects(a, b) }, 1);
    assert_eq!(unsafe { ffi::vpi_compare_objects(a, other) }, 0);

    assert_eq!(unsafe { ffi::vpi_release_handle(a) }, 1);
    // A released word no longer resolves, and re-releasing is a no-op.
    assert_eq!(unsafe { ffi::vpi_compare_objects(a, b) }, 0);
    assert_eq!(unsafe { ffi::vpi_free_object(a) }, 0);
    // The slot gets reused without resurrecting the stale word.
    let c = by_name("t.byte8");
    assert_eq!(unsafe { ffi::vpi_compare_objects(a, c) }, 0);
    assert_eq!(get(Property::Size, c), 8);
}

extern "C" fn counting_cb(data: *mut CbData) -> i32 {
    // SAFETY: the dispatcher passes a valid data block whose user_data was
    // set to an AtomicU32 by the registering test.
    let counter = unsafe { &*(*data).user_data.cast::<AtomicU32>() };
    counter.fetch_add(1, Ordering::SeqCst);
    0
}

#[test]
fn test_after_delay_fires_once_at_deadline() {
    let bench = Bench::install();
    bench.set_time(100);
    let fired = AtomicU32::new(0);
    let mut time = sim_time(10);
    let mut cb_data = empty_cb_data();
    cb_data.time = &mut time;
    cb_data.user_data = std::ptr::addr_of!(fired).cast_mut().cast();
    let handle = register(CbReason::AfterDelay, counting_cb, &mut cb_data);
    assert!(!handle.is_null());
    assert_eq!(vpi_runtime::next_deadline(), Some(110));

    bench.set_time(109);
    assert_eq!(vpi_runtime::call_timed_cbs(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    bench.set_time(110);
    assert_eq!(vpi_runtime::call_timed_cbs(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(vpi_runtime::next_deadline(), None);
    assert_eq!(vpi_runtime::call_timed_cbs(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_after_delay_removed_before_deadline_never_fires() {
    let bench = Bench::install();
    bench.set_time(50);
    let fired = AtomicU32::new(0);
    let mut time = sim_time(5);
    let mut cb_data = empty_cb_data();
    cb_data.time = &mut time;
    cb_data.user_data = std::ptr::addr_of!(fired).cast_mut().cast();
    let handle = register(CbReason::AfterDelay, counting_cb, &mut cb_data);
    assert_eq!(unsafe { ffi::vpi_remove_cb(handle) }, 1);

    bench.set_time(60);
    assert_eq!(vpi_runtime::call_timed_cbs(), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(vpi_runtime::next_deadline(), None);
}

static CHANGE_COUNT: AtomicU32 = AtomicU32::new(0);
static CHANGE_LAST: AtomicI32 = AtomicI32::new(-1);

extern "C" fn change_cb(data: *mut CbData) -> i32 {
    CHANGE_COUNT.fetch_add(1, Ordering::SeqCst);
    // SAFETY: the dispatcher delivers the value in the registered format
    // for the duration of this call.
    unsafe {
        let value = (*data).value;
        if !value.is_null() {
            CHANGE_LAST.store((*value).value.integer, Ordering::SeqCst);
        }
    }
    0
}

#[test]
fn test_value_change_detection() {
    let bench = Bench::install();
    CHANGE_COUNT.store(0, Ordering::SeqCst);
    CHANGE_LAST.store(-1, Ordering::SeqCst);

    let onebit = by_name("t.onebit");
    let mut value = VpiValue {
        format: ValueFormat::Int as i32,
        value: ValueUnion { integer: 0 },
    };
    let mut cb_data = empty_cb_data();
    cb_data.obj = onebit;
    cb_data.value = &mut value;
    let handle = register(CbReason::ValueChange, change_cb, &mut cb_data);
    assert!(!handle.is_null());

    // No storage change, no delivery.
    assert_eq!(vpi_runtime::call_value_change_cbs(), 0);
    assert_eq!(CHANGE_COUNT.load(Ordering::SeqCst), 0);

    bench.onebit.set(1);
    assert_eq!(vpi_runtime::call_value_change_cbs(), 1);
    assert_eq!(CHANGE_COUNT.load(Ordering::SeqCst), 1);
    assert_eq!(CHANGE_LAST.load(Ordering::SeqCst), 1);

    // Stable storage between passes stays silent.
    assert_eq!(vpi_runtime::call_value_change_cbs(), 0);
    assert_eq!(CHANGE_COUNT.load(Ordering::SeqCst), 1);

    bench.onebit.set(0);
    assert_eq!(vpi_runtime::call_value_change_cbs(), 1);
    assert_eq!(CHANGE_LAST.load(Ordering::SeqCst), 0);

    // Removal stops delivery even with a pending change.
    bench.onebit.set(1);
    assert_eq!(unsafe { ffi::vpi_remove_cb(handle) }, 1);
    assert_eq!(vpi_runtime::call_value_change_cbs(), 0);
}

#[test]
fn test_value_change_on_memory_word() {
    let bench = Bench::install();
    let mem0 = by_name("t.mem0");
    let word = unsafe { ffi::vpi_handle_by_index(mem0, 3) };
    let fired = AtomicU32::new(0);
    let mut cb_data = empty_cb_data();
    cb_data.obj = word;
    cb_data.user_data = std::ptr::addr_of!(fired).cast_mut().cast();
    assert!(!register(CbReason::ValueChange, counting_cb, &mut cb_data).is_null());

    // A write to a different word is not a change of this one.
    bench.mem0[7].set(0xffff);
    assert_eq!(vpi_runtime::call_value_change_cbs(), 0);

    bench.mem0[2].set(0xabcd);
    assert_eq!(vpi_runtime::call_value_change_cbs(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_start_of_sim_callback_removes_itself() {
    static SELF_HANDLE: AtomicUsize = AtomicUsize::new(0);
    static FIRED: AtomicU32 = AtomicU32::new(0);
    static REMOVED: AtomicI32 = AtomicI32::new(-1);

    // No asserts in here: a panic cannot unwind across the C ABI.
    extern "C" fn self_removing_cb(_data: *mut CbData) -> i32 {
        FIRED.fetch_add(1, Ordering::SeqCst);
        let raw = SELF_HANDLE.load(Ordering::SeqCst) as RawHandle;
        REMOVED.store(unsafe { ffi::vpi_remove_cb(raw) }, Ordering::SeqCst);
        0
    }

    let _bench = Bench::install();
    FIRED.store(0, Ordering::SeqCst);
    let mut cb_data = empty_cb_data();
    let handle = register(CbReason::StartOfSimulation, self_removing_cb, &mut cb_data);
    SELF_HANDLE.store(handle as usize, Ordering::SeqCst);

    assert_eq!(vpi_runtime::call_cbs(CbReason::StartOfSimulation), 1);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    assert_eq!(REMOVED.load(Ordering::SeqCst), 1);
    // Gone on the next pass.
    assert_eq!(vpi_runtime::call_cbs(CbReason::StartOfSimulation), 0);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
}

#[test]
fn test_callback_registering_same_reason_joins_next_pass() {
    static FIRED: AtomicU32 = AtomicU32::new(0);

    extern "C" fn chaining_cb(data: *mut CbData) -> i32 {
        FIRED.fetch_add(1, Ordering::SeqCst);
        // Re-arm once: only the first invocation chains a successor.
        if FIRED.load(Ordering::SeqCst) == 1 {
            let mut cb_data = empty_cb_data();
            cb_data.reason = unsafe { (*data).reason };
            cb_data.cb_rtn = Some(chaining_cb);
            unsafe { ffi::vpi_register_cb(&mut cb_data) };
        }
        0
    }

    let _bench = Bench::install();
    FIRED.store(0, Ordering::SeqCst);
    let mut cb_data = empty_cb_data();
    register(CbReason::ReadOnlySynch, chaining_cb, &mut cb_data);

    // The registration from inside the pass is not delivered in that pass.
    assert_eq!(vpi_runtime::call_cbs(CbReason::ReadOnlySynch), 1);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    // Both live registrations fire on the next pass.
    assert_eq!(vpi_runtime::call_cbs(CbReason::ReadOnlySynch), 2);
    assert_eq!(FIRED.load(Ordering::SeqCst), 3);
}

#[test]
fn test_timed_callback_chains_due_deadline() {
    static FIRED: AtomicU32 = AtomicU32::new(0);

    extern "C" fn chaining_timed_cb(_data: *mut CbData) -> i32 {
        FIRED.fetch_add(1, Ordering::SeqCst);
        if FIRED.load(Ordering::SeqCst) == 1 {
            // An immediately-due successor joins the same dispatch pass.
            let mut time = VpiTime {
                type_: TimeType::Sim as i32,
                high: 0,
                low: 0,
                real: 0.0,
            };
            let mut cb_data = empty_cb_data();
            cb_data.reason = CbReason::AfterDelay as i32;
            cb_data.cb_rtn = Some(chaining_timed_cb);
            cb_data.time = &mut time;
            unsafe { ffi::vpi_register_cb(&mut cb_data) };
        }
        0
    }

    let bench = Bench::install();
    FIRED.store(0, Ordering::SeqCst);
    bench.set_time(10);
    let mut time = sim_time(2);
    let mut cb_data = empty_cb_data();
    cb_data.time = &mut time;
    register(CbReason::AfterDelay, chaining_timed_cb, &mut cb_data);

    bench.set_time(12);
    assert_eq!(vpi_runtime::call_timed_cbs(), 2);
    assert_eq!(FIRED.load(Ordering::SeqCst), 2);
    assert_eq!(vpi_runtime::next_deadline(), None);
}

#[test]
fn test_unsupported_reason_and_relation_warn() {
    let _bench = Bench::install();
    let mut cb_data = empty_cb_data();
    cb_data.reason = 2; // cbStmt
    cb_data.cb_rtn = Some(counting_cb);
    assert!(unsafe { ffi::vpi_register_cb(&mut cb_data) }.is_null());
    assert_eq!(error_level(), Severity::Warning as i32);

    let onebit = by_name("t.onebit");
    // vpiParent
    assert!(unsafe { ffi::vpi_handle(81, onebit) }.is_null());
    assert_eq!(error_level(), Severity::Warning as i32);

    let scope = by_name("t");
    // vpiModule iteration is not an iterable kind here.
    assert!(unsafe { ffi::vpi_iterate(ObjectType::Module as i32, scope) }.is_null());
    assert_eq!(error_level(), Severity::Warning as i32);
}

#[test]
fn test_control_finish_and_stop() {
    let bench = Bench::install();
    assert_eq!(unsafe { ffi::vpi_control(ControlOp::Finish as i32) }, 1);
    assert_eq!(bench.state.borrow().finish.as_deref(), Some("*VPI*:0"));

    assert_eq!(unsafe { ffi::vpi_control(ControlOp::Stop as i32) }, 1);
    assert_eq!(bench.state.borrow().stop.as_deref(), Some("*VPI*:0"));

    // vpiReset is out of scope.
    assert_eq!(unsafe { ffi::vpi_control(68) }, 0);
    assert_eq!(error_level(), Severity::Warning as i32);
}

#[test]
fn test_mcd_channels_round_trip() {
    let _bench = Bench::install();
    let path = std::env::temp_dir().join(format!("vpi_mcd_{}.log", std::process::id()));
    let path_c = CString::new(path.to_str().unwrap()).unwrap();

    let mcd = unsafe { ffi::vpi_mcd_open(path_c.as_ptr()) };
    assert!(mcd >= 4, "file channels start above the console bits");

    let line = CString::new("hello from vpi\n").unwrap();
    let written = unsafe { ffi::vpi_mcd_printf(mcd, line.as_ptr()) };
    assert_eq!(written, 15);
    assert_eq!(unsafe { ffi::vpi_mcd_flush(mcd) }, 0);
    assert_eq!(unsafe { ffi::vpi_mcd_close(mcd) }, 0);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello from vpi\n");
    std::fs::remove_file(&path).ok();

    // The closed channel warns and writes nothing.
    assert_eq!(unsafe { ffi::vpi_mcd_printf(mcd, line.as_ptr()) }, 0);
    assert_eq!(error_level(), Severity::Warning as i32);
    // Console channels cannot be closed.
    assert_ne!(unsafe { ffi::vpi_mcd_close(1) }, 0);
}

#[test]
fn test_fatal_policy_escalates_errors() {
    let bench = Bench::install();
    bench.state.borrow_mut().fatal_on_error = true;

    // An error-severity condition inside a dispatch pass reaches the
    // model's fatal hook: IntVal delivery is unsupported on U64 storage.
    let quad = by_name("t.quad");
    let mut value = VpiValue {
        format: ValueFormat::Int as i32,
        value: ValueUnion { integer: 0 },
    };
    let mut cb_data = empty_cb_data();
    cb_data.obj = quad;
    cb_data.value = &mut value;
    assert!(!register(CbReason::ValueChange, counting_cb, &mut cb_data).is_null());

    bench.quad.set(7);
    let outcome = std::panic::catch_unwind(vpi_runtime::call_value_change_cbs);
    let message = *outcome.unwrap_err().downcast::<String>().unwrap();
    assert!(message.contains("unsupported format"), "got: {message}");
}

#[test]
fn test_fatal_policy_off_only_records() {
    let bench = Bench::install();
    let quad = by_name("t.quad");
    bench.quad.set(9);
    assert_eq!(get_int(quad), 0);
    assert_eq!(error_level(), Severity::Error as i32);
}
