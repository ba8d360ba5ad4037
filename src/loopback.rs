//! An in-process server backing the [`Transport`] trait.
//!
//! Every record lives in shared memory behind the transport boundary, so the
//! full channel lifecycle - searching, connecting, reading, writing, alarm
//! evaluation, monitors, disconnection - can be exercised without a network
//! or a real server. Requests buffer exactly like a wire transport: nothing
//! happens until `flush`, and completions only surface through `process`.
//!
//! Clone the [`Loopback`] before handing it to a
//! [`Context`][crate::context::Context]; the clone is the test's side door
//! for adding records and for forcing servers on and off line.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use num::{Bounded, NumCast};
use tracing::debug;

use crate::{
    dbr::{
        AlarmCondition, AlarmSeverity, Dbr, DbrBasicType, DbrCategory, DbrControl, DbrGraphics,
        DbrType, DbrValue, Limits, Status,
    },
    status::ErrorCondition,
    transport::{
        ChannelId, ChannelMetadata, EventMask, IoId, SubscriptionId, Transport, TransportEvent,
    },
};

const HOST_NAME: &str = "loopback";

/// Description of a record to serve, built up before registration.
#[derive(Clone, Debug)]
pub struct RecordSpec {
    value: DbrValue,
    count: Option<usize>,
    units: String,
    precision: i16,
    display: (f64, f64),
    warning: (f64, f64),
    alarm: (f64, f64),
    control: (f64, f64),
    states: Vec<String>,
    state_severities: Vec<AlarmSeverity>,
    read_access: bool,
    write_access: bool,
}

impl RecordSpec {
    pub fn new(value: impl Into<DbrValue>) -> Self {
        RecordSpec {
            value: value.into(),
            count: None,
            units: String::new(),
            precision: 0,
            display: (f64::NEG_INFINITY, f64::INFINITY),
            warning: (f64::NEG_INFINITY, f64::INFINITY),
            alarm: (f64::NEG_INFINITY, f64::INFINITY),
            control: (f64::NEG_INFINITY, f64::INFINITY),
            states: Vec::new(),
            state_severities: Vec::new(),
            read_access: true,
            write_access: true,
        }
    }

    /// An enumerated record starting in its first state.
    pub fn enumerated(states: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut spec = Self::new(DbrValue::Enum(0));
        spec.states = states.into_iter().map(Into::into).collect();
        spec
    }

    /// Pad (or truncate) the stored value to a fixed element count.
    pub fn element_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    pub fn precision(mut self, precision: i16) -> Self {
        self.precision = precision;
        self
    }

    pub fn display_limits(mut self, lower: f64, upper: f64) -> Self {
        self.display = (lower, upper);
        self
    }

    /// The minor alarm band: below `lower` is Low, above `upper` is High.
    pub fn warning_limits(mut self, lower: f64, upper: f64) -> Self {
        self.warning = (lower, upper);
        self
    }

    /// The major alarm band: below `lower` is LoLo, above `upper` is HiHi.
    pub fn alarm_limits(mut self, lower: f64, upper: f64) -> Self {
        self.alarm = (lower, upper);
        self
    }

    pub fn control_limits(mut self, lower: f64, upper: f64) -> Self {
        self.control = (lower, upper);
        self
    }

    /// Per-state alarm severities for an enumerated record, in state order.
    pub fn state_severities(mut self, severities: impl IntoIterator<Item = AlarmSeverity>) -> Self {
        self.state_severities = severities.into_iter().collect();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.write_access = false;
        self
    }
}

struct Record {
    value: DbrValue,
    native_count: usize,
    units: String,
    precision: i16,
    display: (f64, f64),
    warning: (f64, f64),
    alarm: (f64, f64),
    control: (f64, f64),
    states: Vec<String>,
    state_severities: Vec<AlarmSeverity>,
    status: Status,
    timestamp: SystemTime,
    read_access: bool,
    write_access: bool,
    online: bool,
}

impl Record {
    fn metadata(&self) -> ChannelMetadata {
        ChannelMetadata {
            native_type: self.value.get_type(),
            element_count: self.native_count,
            host_name: HOST_NAME.to_string(),
            read_access: self.read_access,
            write_access: self.write_access,
            enum_states: self.states.clone(),
        }
    }

    /// Assemble an outgoing value at the requested type and count.
    fn load(&self, dbr_type: DbrType, count: usize) -> Result<Dbr, ErrorCondition> {
        if count > self.native_count {
            return Err(ErrorCondition::BadCount);
        }
        let mut value = self.value.clone();
        if !matches!(value, DbrValue::Enum(_)) {
            let _ = value.resize(count);
        }
        let native_type = self.value.get_type();
        // An enum read back as a string gets its state label
        let value = if dbr_type.basic_type == DbrBasicType::String
            && native_type == DbrBasicType::Enum
        {
            let DbrValue::Enum(index) = value else {
                unreachable!()
            };
            let label = self
                .states
                .get(index as usize)
                .cloned()
                .unwrap_or_default();
            DbrValue::String(vec![label])
        } else {
            value.convert_to(dbr_type.basic_type)?
        };
        let basic = dbr_type.basic_type;
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status {
                status: self.status,
                value,
            },
            DbrCategory::Time => Dbr::Time {
                status: self.status,
                timestamp: self.timestamp,
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status: self.status,
                graphics: self.graphics(basic),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status: self.status,
                graphics: self.graphics(basic),
                control: self.control(basic),
                value,
            },
        })
    }

    fn graphics(&self, basic: DbrBasicType) -> DbrGraphics {
        match basic {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum {
                states: self.states.clone(),
            },
            DbrBasicType::Char => DbrGraphics::Char {
                units: self.units.clone(),
                limits: self.limits(),
            },
            DbrBasicType::Int => DbrGraphics::Int {
                units: self.units.clone(),
                limits: self.limits(),
            },
            DbrBasicType::Long => DbrGraphics::Long {
                units: self.units.clone(),
                limits: self.limits(),
            },
            DbrBasicType::Float => DbrGraphics::Float {
                units: self.units.clone(),
                limits: self.limits(),
                precision: self.precision,
            },
            DbrBasicType::Double => DbrGraphics::Double {
                units: self.units.clone(),
                limits: self.limits(),
                precision: self.precision,
            },
        }
    }

    fn control(&self, basic: DbrBasicType) -> DbrControl {
        fn pair<T: NumCast + Bounded>(limits: (f64, f64)) -> (T, T) {
            (
                NumCast::from(limits.0).unwrap_or_else(T::min_value),
                NumCast::from(limits.1).unwrap_or_else(T::max_value),
            )
        }
        match basic {
            DbrBasicType::String => DbrControl::String,
            DbrBasicType::Enum => DbrControl::Enum,
            DbrBasicType::Char => {
                let (lo, hi) = pair(self.control);
                DbrControl::Char(lo, hi)
            }
            DbrBasicType::Int => {
                let (lo, hi) = pair(self.control);
                DbrControl::Int(lo, hi)
            }
            DbrBasicType::Long => {
                let (lo, hi) = pair(self.control);
                DbrControl::Long(lo, hi)
            }
            DbrBasicType::Float => {
                let (lo, hi) = pair(self.control);
                DbrControl::Float(lo, hi)
            }
            DbrBasicType::Double => {
                let (lo, hi) = pair(self.control);
                DbrControl::Double(lo, hi)
            }
        }
    }

    fn limits<T: NumCast + Bounded + Copy>(&self) -> Limits<T> {
        fn pair<T: NumCast + Bounded>(limits: (f64, f64)) -> (T, T) {
            (
                NumCast::from(limits.0).unwrap_or_else(T::min_value),
                NumCast::from(limits.1).unwrap_or_else(T::max_value),
            )
        }
        Limits {
            display: pair(self.display),
            alarm: pair(self.alarm),
            warning: pair(self.warning),
        }
    }

    /// Write the incoming elements over the front of the stored value,
    /// leaving any tail beyond `count` untouched.
    fn store(&mut self, value: &DbrValue, count: usize) -> Result<(), ErrorCondition> {
        let native_type = self.value.get_type();
        let converted = value.convert_to(native_type)?;
        let count = count.min(converted.get_count()).min(self.native_count);
        fn splice<T: Clone>(current: &mut [T], incoming: &[T], count: usize) {
            current[..count].clone_from_slice(&incoming[..count]);
        }
        match (&mut self.value, &converted) {
            (DbrValue::Enum(cur), DbrValue::Enum(new)) => *cur = *new,
            (DbrValue::String(cur), DbrValue::String(new)) => splice(cur, new, count),
            (DbrValue::Char(cur), DbrValue::Char(new)) => splice(cur, new, count),
            (DbrValue::Int(cur), DbrValue::Int(new)) => splice(cur, new, count),
            (DbrValue::Long(cur), DbrValue::Long(new)) => splice(cur, new, count),
            (DbrValue::Float(cur), DbrValue::Float(new)) => splice(cur, new, count),
            (DbrValue::Double(cur), DbrValue::Double(new)) => splice(cur, new, count),
            _ => return Err(ErrorCondition::NoConvert),
        }
        self.timestamp = SystemTime::now();
        self.status = self.evaluate_alarm();
        Ok(())
    }

    /// Re-derive the alarm state from the stored value and the limits.
    fn evaluate_alarm(&self) -> Status {
        if let DbrValue::Enum(index) = self.value {
            let severity = if (index as usize) < self.states.len() {
                self.state_severities
                    .get(index as usize)
                    .copied()
                    .unwrap_or_default()
            } else {
                AlarmSeverity::Invalid
            };
            let status = if severity == AlarmSeverity::No {
                AlarmCondition::No
            } else {
                AlarmCondition::State
            };
            return Status { status, severity };
        }
        let Ok(as_double) = Vec::<f64>::try_from(&self.value) else {
            return Status::default();
        };
        let Some(&level) = as_double.first() else {
            return Status::default();
        };
        let (status, severity) = if level >= self.alarm.1 {
            (AlarmCondition::HiHi, AlarmSeverity::Major)
        } else if level <= self.alarm.0 {
            (AlarmCondition::LoLo, AlarmSeverity::Major)
        } else if level >= self.warning.1 {
            (AlarmCondition::High, AlarmSeverity::Minor)
        } else if level <= self.warning.0 {
            (AlarmCondition::Low, AlarmSeverity::Minor)
        } else {
            (AlarmCondition::No, AlarmSeverity::No)
        };
        Status { status, severity }
    }
}

enum Request {
    CreateChannel {
        cid: ChannelId,
        name: String,
    },
    ClearChannel {
        cid: ChannelId,
    },
    Get {
        cid: ChannelId,
        ioid: IoId,
        dbr_type: DbrType,
        count: usize,
    },
    Put {
        cid: ChannelId,
        ioid: Option<IoId>,
        value: DbrValue,
        count: usize,
    },
    Subscribe {
        cid: ChannelId,
        evid: SubscriptionId,
        dbr_type: DbrType,
        count: usize,
        mask: EventMask,
    },
    Unsubscribe {
        evid: SubscriptionId,
    },
}

struct Subscription {
    cid: ChannelId,
    dbr_type: DbrType,
    count: usize,
    mask: EventMask,
}

struct Binding {
    name: String,
    connected: bool,
}

#[derive(Default)]
struct ServerState {
    records: HashMap<String, Record>,
    channels: HashMap<ChannelId, Binding>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    queue: Vec<Request>,
    outbox: VecDeque<TransportEvent>,
}

impl ServerState {
    /// Answer any search whose record now exists and is online.
    fn resolve_searches(&mut self) {
        let waiting: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, b)| !b.connected)
            .map(|(cid, _)| *cid)
            .collect();
        for cid in waiting {
            let name = self.channels[&cid].name.clone();
            if let Some(record) = self.records.get(&name)
                && record.online
            {
                let metadata = record.metadata();
                self.channels.get_mut(&cid).unwrap().connected = true;
                self.outbox
                    .push_back(TransportEvent::Connected { cid, metadata });
            }
        }
    }

    fn record_for(&self, cid: ChannelId) -> Result<&str, ErrorCondition> {
        let binding = self.channels.get(&cid).ok_or(ErrorCondition::BadChId)?;
        if !binding.connected {
            return Err(ErrorCondition::Disconn);
        }
        Ok(&binding.name)
    }

    fn execute(&mut self, request: Request) {
        match request {
            Request::CreateChannel { cid, name } => {
                self.channels.insert(
                    cid,
                    Binding {
                        name,
                        connected: false,
                    },
                );
            }
            Request::ClearChannel { cid } => {
                self.channels.remove(&cid);
                self.subscriptions.retain(|_, sub| sub.cid != cid);
            }
            Request::Get {
                cid,
                ioid,
                dbr_type,
                count,
            } => {
                let status = self
                    .record_for(cid)
                    .map(str::to_string)
                    .and_then(|name| self.records[&name].load(dbr_type, count));
                self.outbox
                    .push_back(TransportEvent::GetComplete { ioid, status });
            }
            Request::Put {
                cid,
                ioid,
                value,
                count,
            } => {
                let result = self.apply_put(cid, &value, count);
                if let Some(ioid) = ioid {
                    self.outbox.push_back(TransportEvent::PutComplete {
                        ioid,
                        status: result,
                    });
                } else if let Err(condition) = result {
                    debug!("Unacknowledged write failed: {condition}");
                }
            }
            Request::Subscribe {
                cid,
                evid,
                dbr_type,
                count,
                mask,
            } => {
                self.subscriptions.insert(
                    evid,
                    Subscription {
                        cid,
                        dbr_type,
                        count,
                        mask,
                    },
                );
                // The current value always opens the stream
                let status = self
                    .record_for(cid)
                    .map(str::to_string)
                    .and_then(|name| self.records[&name].load(dbr_type, count));
                self.outbox
                    .push_back(TransportEvent::MonitorUpdate { evid, status });
            }
            Request::Unsubscribe { evid } => {
                self.subscriptions.remove(&evid);
            }
        }
    }

    fn apply_put(
        &mut self,
        cid: ChannelId,
        value: &DbrValue,
        count: usize,
    ) -> Result<(), ErrorCondition> {
        let name = self.record_for(cid)?.to_string();
        let record = self.records.get_mut(&name).ok_or(ErrorCondition::PutFail)?;
        if !record.write_access {
            return Err(ErrorCondition::NoWtAccess);
        }
        let value_before = record.value.clone();
        let status_before = record.status;
        record.store(value, count)?;
        let value_changed = record.value != value_before;
        let alarm_changed = record.status != status_before;
        self.fire_monitors(&name, value_changed, alarm_changed);
        Ok(())
    }

    /// Push updates to every live subscription on `name` whose mask matches
    /// what changed.
    fn fire_monitors(&mut self, name: &str, value_changed: bool, alarm_changed: bool) {
        let fired: Vec<(SubscriptionId, DbrType, usize)> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| {
                self.channels
                    .get(&sub.cid)
                    .is_some_and(|b| b.connected && b.name == name)
            })
            .filter(|(_, sub)| {
                (value_changed && (sub.mask.value || sub.mask.log))
                    || (alarm_changed && sub.mask.alarm)
            })
            .map(|(evid, sub)| (*evid, sub.dbr_type, sub.count))
            .collect();
        for (evid, dbr_type, count) in fired {
            let status = self.records[name].load(dbr_type, count);
            self.outbox
                .push_back(TransportEvent::MonitorUpdate { evid, status });
        }
    }

    fn set_online(&mut self, name: &str, online: bool) {
        if let Some(record) = self.records.get_mut(name) {
            record.online = online;
        }
        if !online {
            let dropped: Vec<ChannelId> = self
                .channels
                .iter()
                .filter(|(_, b)| b.connected && b.name == name)
                .map(|(cid, _)| *cid)
                .collect();
            for cid in dropped {
                self.channels.get_mut(&cid).unwrap().connected = false;
                self.outbox.push_back(TransportEvent::Disconnected { cid });
            }
        }
        // Reconnection happens at the next flush via resolve_searches
    }
}

/// The shared in-process server. Clones all point at the same records.
#[derive(Clone, Default)]
pub struct Loopback {
    state: Arc<Mutex<ServerState>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record. Channels already searching for this name connect
    /// at the next flush.
    pub fn add_record(&self, name: &str, spec: RecordSpec) {
        let mut value = spec.value;
        let native_count = match spec.count {
            Some(count) => {
                let _ = value.resize(count);
                count
            }
            None => value.get_count(),
        };
        let mut record = Record {
            value,
            native_count,
            units: spec.units,
            precision: spec.precision,
            display: spec.display,
            warning: spec.warning,
            alarm: spec.alarm,
            control: spec.control,
            states: spec.states,
            state_severities: spec.state_severities,
            status: Status::default(),
            timestamp: SystemTime::now(),
            read_access: spec.read_access,
            write_access: spec.write_access,
            online: true,
        };
        record.status = record.evaluate_alarm();
        self.state
            .lock()
            .unwrap()
            .records
            .insert(name.to_string(), record);
    }

    /// Pretend the server owning `name` went away. Connected channels drop
    /// to previously-connected and start searching again.
    pub fn take_offline(&self, name: &str) {
        self.state.lock().unwrap().set_online(name, false);
    }

    /// Bring a record back; searching channels reconnect at the next flush.
    pub fn bring_online(&self, name: &str) {
        self.state.lock().unwrap().set_online(name, true);
    }

    /// Revise the access rights on a record, notifying connected channels.
    pub fn set_access(&self, name: &str, read: bool, write: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(name) {
            record.read_access = read;
            record.write_access = write;
        }
        let connected: Vec<ChannelId> = state
            .channels
            .iter()
            .filter(|(_, b)| b.connected && b.name == name)
            .map(|(cid, _)| *cid)
            .collect();
        for cid in connected {
            state
                .outbox
                .push_back(TransportEvent::AccessRights { cid, read, write });
        }
    }

    /// Direct read of a record's stored value, bypassing the channel layer.
    pub fn stored_value(&self, name: &str) -> Option<DbrValue> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(name)
            .map(|record| record.value.clone())
    }
}

impl Transport for Loopback {
    fn create_channel(&mut self, cid: ChannelId, name: &str) {
        self.state.lock().unwrap().queue.push(Request::CreateChannel {
            cid,
            name: name.to_string(),
        });
    }

    fn clear_channel(&mut self, cid: ChannelId) {
        self.state
            .lock()
            .unwrap()
            .queue
            .push(Request::ClearChannel { cid });
    }

    fn get(&mut self, cid: ChannelId, ioid: IoId, dbr_type: DbrType, count: usize) {
        self.state.lock().unwrap().queue.push(Request::Get {
            cid,
            ioid,
            dbr_type,
            count,
        });
    }

    fn put(
        &mut self,
        cid: ChannelId,
        ioid: Option<IoId>,
        _dbr_type: DbrBasicType,
        count: usize,
        value: DbrValue,
    ) {
        self.state.lock().unwrap().queue.push(Request::Put {
            cid,
            ioid,
            value,
            count,
        });
    }

    fn create_subscription(
        &mut self,
        cid: ChannelId,
        evid: SubscriptionId,
        dbr_type: DbrType,
        count: usize,
        mask: EventMask,
    ) {
        self.state.lock().unwrap().queue.push(Request::Subscribe {
            cid,
            evid,
            dbr_type,
            count,
            mask,
        });
    }

    fn clear_subscription(&mut self, evid: SubscriptionId) {
        self.state
            .lock()
            .unwrap()
            .queue
            .push(Request::Unsubscribe { evid });
    }

    fn flush(&mut self) -> Result<(), ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        let queued: Vec<Request> = state.queue.drain(..).collect();
        for request in queued {
            state.execute(request);
        }
        state.resolve_searches();
        Ok(())
    }

    fn process(&mut self, budget: Duration, sink: &mut dyn FnMut(TransportEvent)) {
        let events: Vec<TransportEvent> = self.state.lock().unwrap().outbox.drain(..).collect();
        if events.is_empty() && !budget.is_zero() {
            // Emulate a blocking receive with nothing on the wire
            std::thread::sleep(budget);
        }
        for event in events {
            sink(event);
        }
    }
}
