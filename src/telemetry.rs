//! Upstream telemetry: metrics parsed from device `DATA:` payloads, the
//! device-list attributes, and the forwarder that drains both to an [`Uplink`].
//!
//! The uplink client itself (MQTT or similar) lives outside this crate; it is
//! reached through the [`Uplink`] trait. [`LogUplink`] is the built-in
//! implementation used by the binary when no real uplink is wired in.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::gateway::GatewayHandle;
use crate::logutil::escape_log;

/// Topic carrying the comma-separated list of devices the backend knows about.
pub const DEVICES_TOPIC: &str = "devices";
pub const ATTR_PENDING_DEVICES: &str = "pendingDevices";
pub const ATTR_ACTIVE_DEVICES: &str = "activeDevices";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    /// `<key>_<device id>`
    pub name: String,
    pub value: f64,
    /// Unix epoch milliseconds.
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// Turn a `key:value[,key:value...]` payload from device `id` into metrics.
/// Items without a `:` or with a non-numeric value are skipped.
pub fn parse_metrics(id: &str, payload: &str, ts_ms: i64) -> Vec<Metric> {
    payload
        .split(',')
        .filter_map(|item| {
            let (key, raw) = item.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            match raw.trim().parse::<f64>() {
                Ok(value) => Some(Metric {
                    name: format!("{}_{}", key, id),
                    value,
                    ts: ts_ms,
                }),
                Err(_) => {
                    debug!(
                        "Skipping non-numeric reading '{}' from {}",
                        escape_log(item),
                        id
                    );
                    None
                }
            }
        })
        .collect()
}

/// Bounded FIFO of metrics waiting for the uplink. When full, the oldest
/// entries are dropped.
#[derive(Debug)]
pub struct MetricQueue {
    items: Mutex<VecDeque<Metric>>,
    capacity: usize,
}

impl MetricQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Metric>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append metrics, returning how many old ones were dropped to make room.
    pub fn push_all(&self, metrics: impl IntoIterator<Item = Metric>) -> usize {
        let mut items = self.lock();
        items.extend(metrics);
        let overflow = items.len().saturating_sub(self.capacity);
        if overflow > 0 {
            items.drain(..overflow);
            warn!("Metric queue full; dropped {} oldest metric(s)", overflow);
        }
        overflow
    }

    pub fn drain(&self) -> Vec<Metric> {
        self.lock().drain(..).collect()
    }

    /// Put unsent metrics back at the front, still honouring capacity.
    fn restore(&self, unsent: Vec<Metric>) {
        let mut items = self.lock();
        for metric in unsent.into_iter().rev() {
            items.push_front(metric);
        }
        while items.len() > self.capacity {
            items.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Everything waiting for the uplink: queued metrics plus a flag saying the
/// device-list attributes need republishing.
#[derive(Debug)]
pub struct Outbox {
    pub metrics: MetricQueue,
    attributes_dirty: AtomicBool,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            metrics: MetricQueue::new(capacity),
            // publish once on the first connection
            attributes_dirty: AtomicBool::new(true),
        }
    }

    /// Parse and queue a `DATA:` payload stamped with the current UTC time.
    pub fn collect(&self, id: &str, payload: &str) -> usize {
        let ts = chrono::Utc::now().timestamp_millis();
        let metrics = parse_metrics(id, payload, ts);
        let n = metrics.len();
        self.metrics.push_all(metrics);
        n
    }

    pub fn mark_attributes_dirty(&self) {
        self.attributes_dirty.store(true, Ordering::Release);
    }

    fn take_attributes_dirty(&self) -> bool {
        self.attributes_dirty.swap(false, Ordering::AcqRel)
    }
}

/// Current device lists as upstream attributes.
pub fn attributes(handle: &GatewayHandle) -> Vec<Attribute> {
    vec![
        Attribute {
            name: ATTR_PENDING_DEVICES.to_string(),
            value: handle.pending_devices().join(","),
        },
        Attribute {
            name: ATTR_ACTIVE_DEVICES.to_string(),
            value: handle.active_devices().join(","),
        },
    ]
}

/// Register every id in a comma-separated list from the [`DEVICES_TOPIC`].
/// Returns how many ids were accepted.
pub fn apply_device_list(handle: &GatewayHandle, value: &str) -> usize {
    let mut accepted = 0;
    for id in value.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        match handle.register_known_device(id) {
            Ok(()) => accepted += 1,
            Err(e) => warn!("Ignoring device '{}' from upstream list: {}", escape_log(id), e),
        }
    }
    info!("Upstream device list applied ({} id(s))", accepted);
    accepted
}

/// A value received on a subscribed upstream topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub value: String,
}

pub trait Uplink: Send {
    fn is_connected(&self) -> bool;
    fn publish_metric(&mut self, metric: &Metric) -> anyhow::Result<()>;
    fn publish_attribute(&mut self, attribute: &Attribute) -> anyhow::Result<()>;
    fn subscribe(&mut self, topic: &str) -> anyhow::Result<()>;
    /// Take everything received on subscribed topics since the last call.
    fn poll_inbound(&mut self) -> Vec<Inbound>;
}

/// Cloneable sender side of a [`LogUplink`]'s inbound queue.
#[derive(Debug, Clone, Default)]
pub struct UplinkInbox {
    queue: Arc<Mutex<VecDeque<Inbound>>>,
}

impl UplinkInbox {
    pub fn deliver(&self, topic: impl Into<String>, value: impl Into<String>) {
        self.lock().push_back(Inbound {
            topic: topic.into(),
            value: value.into(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Inbound>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Uplink that only logs what it would publish. Inbound values are whatever
/// gets pushed through its [`UplinkInbox`].
#[derive(Debug, Default)]
pub struct LogUplink {
    subscriptions: Vec<String>,
    inbox: UplinkInbox,
}

impl LogUplink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn inbox(&self) -> UplinkInbox {
        self.inbox.clone()
    }
}

impl Uplink for LogUplink {
    fn is_connected(&self) -> bool {
        true
    }

    fn publish_metric(&mut self, metric: &Metric) -> anyhow::Result<()> {
        info!("metric {} = {} @ {}", metric.name, metric.value, metric.ts);
        Ok(())
    }

    fn publish_attribute(&mut self, attribute: &Attribute) -> anyhow::Result<()> {
        info!("attribute {} = '{}'", attribute.name, attribute.value);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        debug!("subscribed to '{}'", topic);
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn poll_inbound(&mut self) -> Vec<Inbound> {
        let received: Vec<Inbound> = self.inbox.lock().drain(..).collect();
        received
            .into_iter()
            .filter(|msg| {
                let wanted = self.subscriptions.iter().any(|t| *t == msg.topic);
                if !wanted {
                    debug!("dropping value on unsubscribed topic '{}'", escape_log(&msg.topic));
                }
                wanted
            })
            .collect()
    }
}

/// Drain the uplink's inbound values and act on them. The [`DEVICES_TOPIC`]
/// list registers its ids as active devices; other topics are only logged.
/// Returns how many device-list updates were applied.
pub fn route_inbound<U: Uplink + ?Sized>(handle: &GatewayHandle, uplink: &mut U) -> usize {
    if !uplink.is_connected() {
        return 0;
    }
    let mut applied = 0;
    for msg in uplink.poll_inbound() {
        if msg.topic == DEVICES_TOPIC {
            apply_device_list(handle, &msg.value);
            applied += 1;
        } else {
            debug!(
                "No handler for upstream topic '{}' ({} byte(s))",
                escape_log(&msg.topic),
                msg.value.len()
            );
        }
    }
    applied
}

/// One forwarding pass. Does nothing while the uplink is disconnected; on a
/// publish failure the unsent metrics go back to the queue.
pub fn flush<U: Uplink + ?Sized>(outbox: &Outbox, handle: &GatewayHandle, uplink: &mut U) -> usize {
    if !uplink.is_connected() {
        return 0;
    }
    if outbox.take_attributes_dirty() {
        for attribute in attributes(handle) {
            if let Err(e) = uplink.publish_attribute(&attribute) {
                warn!("Publishing attribute {} failed: {}", attribute.name, e);
                outbox.mark_attributes_dirty();
                break;
            }
        }
    }

    let mut batch = outbox.metrics.drain();
    let mut sent = 0;
    while sent < batch.len() {
        if let Err(e) = uplink.publish_metric(&batch[sent]) {
            warn!("Publishing metric {} failed: {}", batch[sent].name, e);
            outbox.metrics.restore(batch.split_off(sent));
            break;
        }
        sent += 1;
    }
    sent
}

/// Route inbound uplink values and forward queued telemetry every `interval`
/// until `shutdown` turns true.
pub async fn forward_metrics<U: Uplink>(
    outbox: Arc<Outbox>,
    handle: GatewayHandle,
    mut uplink: U,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {
                route_inbound(&handle, &mut uplink);
                flush(outbox.as_ref(), &handle, &mut uplink);
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    // last chance for anything collected during shutdown
    route_inbound(&handle, &mut uplink);
    flush(outbox.as_ref(), &handle, &mut uplink);
    debug!("Telemetry forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::{Gateway, MemoryTransport};

    #[derive(Default)]
    struct Recorder {
        offline: bool,
        fail_after: Option<usize>,
        metrics: Vec<Metric>,
        attributes: Vec<Attribute>,
        inbound: Vec<Inbound>,
    }

    impl Uplink for Recorder {
        fn is_connected(&self) -> bool {
            !self.offline
        }
        fn publish_metric(&mut self, metric: &Metric) -> anyhow::Result<()> {
            if self.fail_after == Some(self.metrics.len()) {
                anyhow::bail!("broker gone");
            }
            self.metrics.push(metric.clone());
            Ok(())
        }
        fn publish_attribute(&mut self, attribute: &Attribute) -> anyhow::Result<()> {
            self.attributes.push(attribute.clone());
            Ok(())
        }
        fn subscribe(&mut self, _topic: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn poll_inbound(&mut self) -> Vec<Inbound> {
            std::mem::take(&mut self.inbound)
        }
    }

    fn inbound(topic: &str, value: &str) -> Inbound {
        Inbound {
            topic: topic.to_string(),
            value: value.to_string(),
        }
    }

    fn metric(name: &str) -> Metric {
        Metric {
            name: name.to_string(),
            value: 1.0,
            ts: 0,
        }
    }

    #[test]
    fn parses_key_value_pairs_into_named_metrics() {
        let m = parse_metrics("D1", "temp:21.5,hum:40", 1_700_000_000_000);
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].name, "temp_D1");
        assert_eq!(m[0].value, 21.5);
        assert_eq!(m[1].name, "hum_D1");
        assert_eq!(m[1].ts, 1_700_000_000_000);

        let single = parse_metrics("D2", "lux: 300", 0);
        assert_eq!(single, vec![Metric { name: "lux_D2".into(), value: 300.0, ts: 0 }]);
    }

    #[test]
    fn skips_unparseable_items() {
        let m = parse_metrics("D1", "temp:abc,garbage,:5,hum:12", 0);
        assert_eq!(m.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(), vec!["hum_D1"]);
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let q = MetricQueue::new(3);
        assert_eq!(q.push_all(["a", "b"].map(metric)), 0);
        assert_eq!(q.push_all(["c", "d", "e"].map(metric)), 2);
        let names: Vec<String> = q.drain().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["c", "d", "e"]);
        assert!(q.is_empty());
    }

    #[test]
    fn device_list_registers_trimmed_ids() {
        let gw = Gateway::new(MemoryTransport::new(), &GatewayConfig::default());
        let handle = gw.handle();
        assert_eq!(apply_device_list(&handle, " D1, D2,,bad id ,D3"), 3);
        assert_eq!(handle.active_devices(), vec!["D1", "D2", "D3"]);
    }

    #[test]
    fn flush_waits_for_connection_and_requeues_failures() {
        let gw = Gateway::new(MemoryTransport::new(), &GatewayConfig::default());
        let handle = gw.handle();
        handle.register_known_device("D1").unwrap();
        let outbox = Outbox::new(10);
        outbox.metrics.push_all(["a", "b", "c"].map(metric));

        let mut uplink = Recorder {
            offline: true,
            ..Recorder::default()
        };
        assert_eq!(flush(&outbox, &handle, &mut uplink), 0);
        assert_eq!(outbox.metrics.len(), 3);

        uplink.offline = false;
        uplink.fail_after = Some(1);
        assert_eq!(flush(&outbox, &handle, &mut uplink), 1);
        assert_eq!(outbox.metrics.len(), 2);
        assert_eq!(
            uplink.attributes,
            vec![
                Attribute { name: "pendingDevices".into(), value: String::new() },
                Attribute { name: "activeDevices".into(), value: "D1".into() },
            ]
        );

        uplink.fail_after = None;
        assert_eq!(flush(&outbox, &handle, &mut uplink), 2);
        let names: Vec<&str> = uplink.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        // attributes only go out again once marked dirty
        assert_eq!(uplink.attributes.len(), 2);
    }

    #[test]
    fn upstream_device_list_makes_devices_active() {
        let mut gw = Gateway::new(MemoryTransport::new(), &GatewayConfig::default());
        let handle = gw.handle();
        let mut uplink = Recorder {
            inbound: vec![inbound("firmware", "1.2"), inbound(DEVICES_TOPIC, "D1,D2")],
            ..Recorder::default()
        };

        assert_eq!(route_inbound(&handle, &mut uplink), 1);
        assert_eq!(handle.active_devices(), vec!["D1", "D2"]);
        assert!(handle.pending_devices().is_empty());
        // nothing left to route
        assert_eq!(route_inbound(&handle, &mut uplink), 0);

        let registry_events = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&registry_events);
        gw.on_registry_changed(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        gw.tick_at(std::time::Instant::now());
        assert_eq!(registry_events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_list_waits_while_disconnected() {
        let gw = Gateway::new(MemoryTransport::new(), &GatewayConfig::default());
        let handle = gw.handle();
        let mut uplink = Recorder {
            offline: true,
            inbound: vec![inbound(DEVICES_TOPIC, "D1")],
            ..Recorder::default()
        };
        assert_eq!(route_inbound(&handle, &mut uplink), 0);
        assert!(handle.active_devices().is_empty());

        uplink.offline = false;
        assert_eq!(route_inbound(&handle, &mut uplink), 1);
        assert_eq!(handle.active_devices(), vec!["D1"]);
    }

    #[test]
    fn log_uplink_only_yields_subscribed_topics() {
        let mut uplink = LogUplink::new();
        let inbox = uplink.inbox();
        inbox.deliver(DEVICES_TOPIC, "D1");
        assert!(uplink.poll_inbound().is_empty());

        uplink.subscribe(DEVICES_TOPIC).unwrap();
        inbox.deliver("other", "x");
        inbox.deliver(DEVICES_TOPIC, "D1,D2");
        assert_eq!(uplink.poll_inbound(), vec![inbound(DEVICES_TOPIC, "D1,D2")]);
        assert!(uplink.poll_inbound().is_empty());
    }

    #[test]
    fn log_uplink_tracks_subscriptions() {
        let mut uplink = LogUplink::new();
        uplink.subscribe(DEVICES_TOPIC).unwrap();
        assert!(uplink.is_connected());
        assert_eq!(uplink.subscriptions(), ["devices".to_string()]);
    }
}
