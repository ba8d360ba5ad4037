use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use cachannel::{
    Context, ErrorCondition, EventMask,
    dbr::{AlarmCondition, AlarmSeverity, Dbr, DbrBasicType, DbrCategory, DbrType, DbrValue},
    loopback::{Loopback, RecordSpec},
};
use cachannel::{channel::ConnectionArgs, ConnectionState};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_writer(TestWriter::new())
        .try_init();
}

/// A context wired to a fresh in-process server
fn connected_context() -> (Loopback, Context) {
    init_logging();
    let server = Loopback::new();
    let ctx = Context::new(Box::new(server.clone()));
    (server, ctx)
}

const SHORT: Duration = Duration::from_millis(200);

#[test]
fn connect_and_introspect() {
    let (server, ctx) = connected_context();
    server.add_record("TEMPERATURE", RecordSpec::new(21.5f64).units("C"));

    let channel = ctx.create_channel("TEMPERATURE");
    assert_eq!(channel.state(), ConnectionState::NeverSearched);
    // Introspection is meaningless before connection
    assert!(channel.field_type().is_err());

    channel.searchw(Some(SHORT)).unwrap();
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(channel.field_type().unwrap(), DbrBasicType::Double);
    assert_eq!(channel.element_count().unwrap(), 1);
    assert_eq!(channel.host_name().unwrap(), "loopback");
    assert!(channel.read_access().unwrap());
    assert!(channel.write_access().unwrap());

    // A second search on a live channel is rejected
    assert_eq!(
        channel.search().unwrap_err().condition(),
        ErrorCondition::BadChId
    );
}

#[test]
fn blocking_put_and_get() {
    let (server, ctx) = connected_context();
    server.add_record("SETPOINT", RecordSpec::new(0.0f64));

    let channel = ctx.create_channel("SETPOINT");
    channel.searchw(Some(SHORT)).unwrap();

    // Scalars of any numeric type coerce to the field's native type
    channel.putw(42i32, None).unwrap();
    let value = channel.getw(None, None).unwrap();
    assert_eq!(value, Dbr::Basic(DbrValue::Double(vec![42.0])));

    // Reads can ask for a different type than stored
    let as_long = channel
        .getw(Some(DbrType::basic(DbrBasicType::Long)), None)
        .unwrap();
    assert_eq!(as_long.value(), &DbrValue::Long(vec![42]));
}

#[test]
fn float_and_string_records_round_trip() {
    let (server, ctx) = connected_context();
    server.add_record("RATE", RecordSpec::new(2.5f32));
    server.add_record("TITLE", RecordSpec::new("startup"));

    let rate = ctx.create_channel("RATE");
    rate.searchw(Some(SHORT)).unwrap();
    assert_eq!(rate.field_type().unwrap(), DbrBasicType::Float);
    rate.putw(7.25f32, None).unwrap();
    assert_eq!(
        rate.getw(None, None).unwrap().value(),
        &DbrValue::Float(vec![7.25])
    );
    // A wider request converts on the way out
    let wide = rate
        .getw(Some(DbrType::basic(DbrBasicType::Double)), None)
        .unwrap();
    assert_eq!(wide.value(), &DbrValue::Double(vec![7.25]));

    let title = ctx.create_channel("TITLE");
    title.searchw(Some(SHORT)).unwrap();
    assert_eq!(title.field_type().unwrap(), DbrBasicType::String);
    title.putw("running", None).unwrap();
    assert_eq!(
        title.getw(None, None).unwrap().value(),
        &DbrValue::String(vec!["running".to_string()])
    );
}

#[test]
fn control_metadata_and_alarm_evaluation() {
    let (server, ctx) = connected_context();
    server.add_record(
        "catest",
        RecordSpec::new(0.0f64)
            .units("mm")
            .precision(4)
            .display_limits(-20.0, 20.0)
            .warning_limits(-10.0, 10.0)
            .alarm_limits(-20.0, 20.0)
            .control_limits(-20.0, 20.0),
    );

    let channel = ctx.create_channel("catest");
    channel.searchw(Some(SHORT)).unwrap();

    // In limits: no alarm
    channel.putw(5.0f64, None).unwrap();
    let sts = channel
        .getw(Some(DbrType::new(DbrBasicType::Double, DbrCategory::Status)), None)
        .unwrap();
    assert_eq!(sts.status().unwrap().severity, AlarmSeverity::No);

    // Way above the major band
    channel.putw(145.0f64, None).unwrap();
    let ctrl = channel
        .getw(
            Some(DbrType::new(DbrBasicType::Double, DbrCategory::Control)),
            None,
        )
        .unwrap();
    assert_eq!(ctrl.value(), &DbrValue::Double(vec![145.0]));
    let status = ctrl.status().unwrap();
    assert_eq!(status.severity, AlarmSeverity::Major);
    assert_eq!(status.status, AlarmCondition::HiHi);
    let graphics = ctrl.graphics().unwrap();
    assert_eq!(graphics.units(), Some("mm"));
    assert_eq!(graphics.precision(), Some(4));

    // The result shape is exactly what was asked for
    let time = channel
        .getw(Some(DbrType::new(DbrBasicType::Double, DbrCategory::Time)), None)
        .unwrap();
    assert!(matches!(time, Dbr::Time { .. }));
    assert!(time.graphics().is_none());
}

#[test]
fn enumerated_records_by_label_and_index() {
    let (server, ctx) = connected_context();
    server.add_record("cabo", RecordSpec::enumerated(["Done", "Busy"]));

    let channel = ctx.create_channel("cabo");
    channel.searchw(Some(SHORT)).unwrap();
    assert_eq!(channel.field_type().unwrap(), DbrBasicType::Enum);

    // Writing a string selects the matching state, never character data
    channel.putw("Busy", None).unwrap();
    let value = channel.getw(None, None).unwrap();
    assert_eq!(value.value(), &DbrValue::Enum(1));

    // Reading back as string produces the state label
    let label = channel
        .getw(Some(DbrType::basic(DbrBasicType::String)), None)
        .unwrap();
    assert_eq!(label.value(), &DbrValue::String(vec!["Busy".to_string()]));

    // Labels match case-sensitively and exactly
    assert_eq!(
        channel.putw("busy", None).unwrap_err().condition(),
        ErrorCondition::BadStr
    );

    // A numeric write is a plain state index
    channel.putw(0i16, None).unwrap();
    assert_eq!(channel.getw(None, None).unwrap().value(), &DbrValue::Enum(0));

    // The state list comes back on the graphics layer
    let graphics = channel
        .getw(
            Some(DbrType::new(DbrBasicType::Enum, DbrCategory::Graphics)),
            None,
        )
        .unwrap();
    assert_eq!(
        graphics.graphics().unwrap().states().unwrap(),
        &["Done".to_string(), "Busy".to_string()]
    );
}

#[test]
fn short_array_writes_leave_the_tail() {
    let (server, ctx) = connected_context();
    server.add_record("WAVEFORM", RecordSpec::new(vec![0i32; 20]));

    let channel = ctx.create_channel("WAVEFORM");
    channel.searchw(Some(SHORT)).unwrap();
    assert_eq!(channel.element_count().unwrap(), 20);

    // Default count is the length of the written value
    channel.putw(vec![1i32, 2, 3], None).unwrap();
    let value = channel.getw(None, Some(4)).unwrap();
    assert_eq!(value.value(), &DbrValue::Long(vec![1, 2, 3, 0]));

    // Asking for more elements than the record holds caps at the native count
    let all = channel.getw(None, Some(50)).unwrap();
    assert_eq!(all.value().get_count(), 20);
}

#[test]
fn char_arrays_read_back_as_strings() {
    let (server, ctx) = connected_context();
    let stored: Vec<i8> = "filename.h5".bytes().map(|b| b as i8).collect();
    server.add_record("FILE_PATH", RecordSpec::new(stored).element_count(64));

    let channel = ctx.create_channel("FILE_PATH");
    channel.searchw(Some(SHORT)).unwrap();
    assert_eq!(channel.field_type().unwrap(), DbrBasicType::Char);

    // Requesting a string from a char field reassembles up to the NUL
    let value = channel
        .getw(Some(DbrType::basic(DbrBasicType::String)), None)
        .unwrap();
    assert_eq!(
        value.value(),
        &DbrValue::String(vec!["filename.h5".to_string()])
    );

    // Writing a string explodes it to bytes, zero-padded to the count
    channel.putw("new.h5", None).unwrap();
    let value = channel
        .getw(Some(DbrType::basic(DbrBasicType::String)), None)
        .unwrap();
    assert_eq!(value.value(), &DbrValue::String(vec!["new.h5".to_string()]));
}

#[test]
fn parked_gets_collected_after_pend() {
    let (server, ctx) = connected_context();
    server.add_record("COUNTER", RecordSpec::new(7i32));

    let channel = ctx.create_channel("COUNTER");
    channel.searchw(Some(SHORT)).unwrap();

    // Nothing parked yet
    assert_eq!(
        channel.get_value().unwrap_err().condition(),
        ErrorCondition::GetFail
    );

    channel.array_get(None, None).unwrap();
    channel.pend_io(Some(SHORT)).unwrap();
    assert_eq!(
        channel.get_value().unwrap().value(),
        &DbrValue::Long(vec![7])
    );
    // The slot is consumed
    assert!(channel.get_value().is_err());
}

#[test]
fn get_and_put_callbacks_fire_inside_pend() {
    let (server, ctx) = connected_context();
    server.add_record("VALVE", RecordSpec::new(1i16));

    let channel = ctx.create_channel("VALVE");
    channel.searchw(Some(SHORT)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    channel
        .array_get_callback(None, None, move |args| {
            sink.lock().unwrap().push(args.status.unwrap().take_value());
        })
        .unwrap();
    // Buffered: nothing happens until a pend primitive runs
    assert!(seen.lock().unwrap().is_empty());
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[DbrValue::Int(vec![1])]);

    let acked = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&acked);
    channel
        .array_put_callback(5i16, None, None, move |args| {
            *sink.lock().unwrap() = Some(args.status);
        })
        .unwrap();
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(*acked.lock().unwrap(), Some(Ok(())));
    assert_eq!(server.stored_value("VALVE"), Some(DbrValue::Int(vec![5])));
}

#[test]
fn monitors_deliver_initial_and_changed_values() {
    let (server, ctx) = connected_context();
    server.add_record("LEVEL", RecordSpec::new(3.0f64));

    let channel = ctx.create_channel("LEVEL");
    channel.searchw(Some(SHORT)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    channel
        .add_masked_array_event(None, None, EventMask::default(), move |args| {
            if let Ok(dbr) = &args.status {
                sink.lock().unwrap().push(dbr.value().clone());
            }
        })
        .unwrap();

    // The current value opens the stream
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[DbrValue::Double(vec![3.0])]);

    channel.array_put(4.0f64, None, None).unwrap();
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);

    // Writing the same value again is not a change
    channel.array_put(4.0f64, None, None).unwrap();
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);

    // After clearing, updates stop
    channel.clear_event().unwrap();
    channel.array_put(9.0f64, None, None).unwrap();
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
    // Clearing again is not an error
    channel.clear_event().unwrap();
}

#[test]
fn clearing_a_channel_silences_its_monitor() {
    let (server, ctx) = connected_context();
    server.add_record("FLOW", RecordSpec::new(1.0f64));

    let channel = ctx.create_channel("FLOW");
    channel.searchw(Some(SHORT)).unwrap();

    let updates = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&updates);
    channel
        .add_masked_array_event(None, None, EventMask::default(), move |_| {
            *sink.lock().unwrap() += 1;
        })
        .unwrap();
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(*updates.lock().unwrap(), 1);

    // A second handle buffers a change the monitor would otherwise see
    let writer = ctx.create_channel("FLOW");
    writer.searchw(Some(SHORT)).unwrap();
    writer.array_put(2.0f64, None, None).unwrap();

    channel.clear_channel().unwrap();
    // A second clear is allowed and does nothing
    channel.clear_channel().unwrap();

    // The write lands, but no further invocation reaches the callback
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(server.stored_value("FLOW"), Some(DbrValue::Double(vec![2.0])));
    assert_eq!(*updates.lock().unwrap(), 1);
}

#[test]
fn monitors_survive_reconnection() {
    let (server, ctx) = connected_context();
    server.add_record("PRESSURE", RecordSpec::new(1.0f64));

    let channel = ctx.create_channel("PRESSURE");
    let transitions: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    channel
        .search_and_connect(move |args: &ConnectionArgs| {
            sink.lock().unwrap().push(args.connected);
        })
        .unwrap();
    ctx.pend_io(SHORT).unwrap();
    assert_eq!(transitions.lock().unwrap().as_slice(), &[true]);

    let updates = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&updates);
    channel
        .add_masked_array_event(None, None, EventMask::default(), move |_| {
            *sink.lock().unwrap() += 1;
        })
        .unwrap();
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(*updates.lock().unwrap(), 1);

    server.take_offline("PRESSURE");
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(channel.state(), ConnectionState::PreviouslyConnected);
    assert_eq!(transitions.lock().unwrap().as_slice(), &[true, false]);
    // Operations against a lost server fail cleanly
    assert_eq!(
        channel.getw(None, None).unwrap_err().condition(),
        ErrorCondition::Disconn
    );

    server.bring_online("PRESSURE");
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(transitions.lock().unwrap().as_slice(), &[true, false, true]);
    // The monitor re-established itself and replayed the current value
    assert_eq!(*updates.lock().unwrap(), 2);
}

#[test]
fn sync_group_members_complete_independently() {
    let (server, ctx) = connected_context();
    server.add_record("SG:A", RecordSpec::new(0.0f64));
    server.add_record("SG:B", RecordSpec::new(11i32));
    server.add_record("SG:C", RecordSpec::new(0i16));

    let a = ctx.create_channel("SG:A");
    let b = ctx.create_channel("SG:B");
    let c = ctx.create_channel("SG:C");
    for channel in [&a, &b, &c] {
        channel.searchw(Some(SHORT)).unwrap();
    }

    let mut group = ctx.create_sync_group();
    let put_a = group.put(&a, 2.5f64, None, None).unwrap();
    let get_b = group.get(&b, None, None).unwrap();
    let get_c = group.get(&c, None, None).unwrap();
    assert_eq!(group.len(), 3);
    assert_eq!(put_a.channel_name(), "SG:A");
    assert_eq!(get_b.channel_name(), "SG:B");
    assert!(!put_a.complete());

    // One member's server dies before anything is transmitted
    server.take_offline("SG:C");
    group.block(SHORT).unwrap();

    assert_eq!(put_a.status(), Some(Ok(())));
    assert!(put_a.value().is_none());
    assert_eq!(
        get_b.value().unwrap().unwrap().value(),
        &DbrValue::Long(vec![11])
    );
    // The failure is confined to its own member
    assert_eq!(
        get_c.status().unwrap().unwrap_err().condition(),
        ErrorCondition::Disconn
    );
    assert!(group.test().unwrap());

    group.reset();
    assert!(group.is_empty());
}

#[test]
fn pend_io_times_out_and_searches_continue() {
    let (server, ctx) = connected_context();

    let channel = ctx.create_channel("NOT:YET:SERVED");
    let err = channel.searchw(Some(Duration::from_millis(30))).unwrap_err();
    assert!(err.is_timeout());
    // The channel is still hunting for its server
    assert_eq!(channel.state(), ConnectionState::Searching);

    // Once the record appears the channel connects on its own
    server.add_record("NOT:YET:SERVED", RecordSpec::new(1i32));
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(channel.state(), ConnectionState::Connected);
}

#[test]
fn cleared_channels_reject_everything() {
    let (server, ctx) = connected_context();
    server.add_record("DOOMED", RecordSpec::new(1i32));

    let channel = ctx.create_channel("DOOMED");
    channel.searchw(Some(SHORT)).unwrap();

    channel.clear_channel().unwrap();
    assert_eq!(channel.state(), ConnectionState::Closed);
    // Idempotent
    channel.clear_channel().unwrap();

    assert_eq!(
        channel.getw(None, None).unwrap_err().condition(),
        ErrorCondition::ChanDestroy
    );
    assert_eq!(
        channel.search().unwrap_err().condition(),
        ErrorCondition::ChanDestroy
    );
    assert_eq!(
        channel.field_type().unwrap_err().condition(),
        ErrorCondition::ChanDestroy
    );
}

#[test]
fn write_access_is_enforced_locally() {
    let (server, ctx) = connected_context();
    server.add_record("READ_ONLY", RecordSpec::new(10i32).read_only());

    let channel = ctx.create_channel("READ_ONLY");
    channel.searchw(Some(SHORT)).unwrap();
    assert!(!channel.write_access().unwrap());
    assert_eq!(
        channel.putw(3i32, None).unwrap_err().condition(),
        ErrorCondition::NoWtAccess
    );
    // Reads still work
    assert_eq!(
        channel.getw(None, None).unwrap().value(),
        &DbrValue::Long(vec![10])
    );
}

#[test]
fn access_rights_callbacks_fire_immediately_and_on_change() {
    let (server, ctx) = connected_context();
    server.add_record("GUARDED", RecordSpec::new(0i32));

    let channel = ctx.create_channel("GUARDED");
    channel.searchw(Some(SHORT)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    channel
        .replace_access_rights_event(Some(Box::new(move |args| {
            sink.lock().unwrap().push((args.read, args.write));
        })))
        .unwrap();
    // Installed on a connected channel: fired at once with current rights
    assert_eq!(seen.lock().unwrap().as_slice(), &[(true, true)]);

    server.set_access("GUARDED", true, false);
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[(true, true), (true, false)]);
    assert!(!channel.write_access().unwrap());
}

#[test]
fn connection_callback_installed_late_sees_current_state() {
    let (server, ctx) = connected_context();
    server.add_record("ALREADY_UP", RecordSpec::new(0i32));

    let channel = ctx.create_channel("ALREADY_UP");
    channel.searchw(Some(SHORT)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    channel
        .change_connection_event(Some(Box::new(move |args: &ConnectionArgs| {
            sink.lock().unwrap().push(args.connected);
        })))
        .unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[true]);
}

#[test]
fn panicking_callbacks_do_not_kill_the_loop() {
    let (server, ctx) = connected_context();
    server.add_record("FRAGILE", RecordSpec::new(1i32));

    let channel = ctx.create_channel("FRAGILE");
    channel.searchw(Some(SHORT)).unwrap();

    channel
        .array_get_callback(None, None, |_| panic!("user code misbehaving"))
        .unwrap();
    ctx.pend_event(Duration::from_millis(20)).unwrap();

    // The loop and the channel are still healthy
    assert_eq!(
        channel.getw(None, None).unwrap().value(),
        &DbrValue::Long(vec![1])
    );
}

#[test]
fn recursive_pend_from_a_callback_is_refused() {
    let (server, ctx) = connected_context();
    server.add_record("NESTED", RecordSpec::new(1i32));

    let channel = ctx.create_channel("NESTED");
    channel.searchw(Some(SHORT)).unwrap();

    let result = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&result);
    let inner_ctx = ctx.clone();
    channel
        .array_get_callback(None, None, move |_| {
            *sink.lock().unwrap() = Some(inner_ctx.poll());
        })
        .unwrap();
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(
        result.lock().unwrap().take().unwrap().unwrap_err().condition(),
        ErrorCondition::EvDisallow
    );
}

#[test]
fn second_thread_cannot_drive_an_attached_context() {
    let (server, ctx) = connected_context();
    server.add_record("OWNED", RecordSpec::new(1i32));

    let channel = ctx.create_channel("OWNED");
    channel.searchw(Some(SHORT)).unwrap();

    let result = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&result);
    let other_ctx = ctx.clone();
    // While this thread sits inside a pend, another thread must be turned
    // away rather than racing the event loop
    channel
        .array_get_callback(None, None, move |_| {
            let other = other_ctx.clone();
            let handle = thread::spawn(move || other.poll());
            *sink.lock().unwrap() = Some(handle.join().unwrap());
        })
        .unwrap();
    ctx.pend_event(Duration::from_millis(20)).unwrap();
    assert_eq!(
        result.lock().unwrap().take().unwrap().unwrap_err().condition(),
        ErrorCondition::IsAttached
    );
}
