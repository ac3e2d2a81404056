//! Locally computed bridged device.
//!
//! No radio: a [`ValueSource`] is sampled on a fixed interval and the
//! result drives the cache and reachability. The shipped source maps a
//! deadline list onto a level attribute that climbs as the deadline nears.

use std::time::Duration;

use chrono::{DateTime, Utc};

use gattbridge_domain::cluster::{
    ATTR_NODE_LABEL, AttributeId, CLUSTER_BASIC_INFORMATION, ClusterId,
};
use gattbridge_domain::error::BridgeError;

use crate::bridge::{BridgeEvent, schedule_event};
use crate::ports::Central;

use super::{Change, DeviceBase, DeviceCtx, fit, read_modeled_constant};

/// Produces the device's current value; `None` means "nothing to report"
/// and the device goes unreachable.
pub trait ValueSource: Send {
    fn sample(&mut self, now: DateTime<Utc>) -> Option<u16>;
}

/// Seconds ahead of a deadline at which the level starts climbing.
const LEVEL_WINDOW_SECS: i64 = 10_800;
const LEVEL_MAX: i64 = 255;

/// Maps the soonest future deadline onto an inverse level: due now is 255,
/// three hours out (or more) is 0. Past deadlines are skipped; with none
/// left the source yields nothing.
pub struct DeadlineLevelSource {
    deadlines: Vec<DateTime<Utc>>,
}

impl DeadlineLevelSource {
    #[must_use]
    pub fn new(deadlines: Vec<DateTime<Utc>>) -> Self {
        Self { deadlines }
    }
}

impl ValueSource for DeadlineLevelSource {
    fn sample(&mut self, now: DateTime<Utc>) -> Option<u16> {
        let remaining = self
            .deadlines
            .iter()
            .filter(|deadline| **deadline > now)
            .map(|deadline| (*deadline - now).num_seconds())
            .min()?;
        let clamped = remaining.clamp(0, LEVEL_WINDOW_SECS);
        let level = LEVEL_MAX - clamped * LEVEL_MAX / LEVEL_WINDOW_SECS;
        Some(u16::try_from(level).unwrap_or(0))
    }
}

pub struct ComputedDevice {
    base: DeviceBase,
    cluster: ClusterId,
    attribute: AttributeId,
    refresh: Duration,
    source: Box<dyn ValueSource>,
    tick_generation: u64,
}

impl ComputedDevice {
    #[must_use]
    pub fn new(
        base: DeviceBase,
        cluster: ClusterId,
        attribute: AttributeId,
        refresh: Duration,
        source: Box<dyn ValueSource>,
    ) -> Self {
        Self {
            base,
            cluster,
            attribute,
            refresh,
            source,
            tick_generation: 0,
        }
    }

    #[must_use]
    pub fn base(&self) -> &DeviceBase {
        &self.base
    }

    /// Registration hook: report the label, take the first sample and arm
    /// the periodic check.
    pub fn init<C: Central>(&mut self, ctx: &DeviceCtx<'_, C>) -> Vec<Change> {
        let mut changes = vec![(CLUSTER_BASIC_INFORMATION, ATTR_NODE_LABEL)];
        changes.extend(self.apply_sample(Utc::now()));
        self.arm_tick(ctx);
        changes
    }

    /// Periodic check fired. Stale generations are ignored; a current one
    /// re-samples and re-arms.
    pub fn on_tick<C: Central>(&mut self, ctx: &DeviceCtx<'_, C>, generation: u64) -> Vec<Change> {
        if generation != self.tick_generation {
            return Vec::new();
        }
        let changes = self.apply_sample(Utc::now());
        self.arm_tick(ctx);
        changes
    }

    fn apply_sample(&mut self, now: DateTime<Utc>) -> Vec<Change> {
        let mut changes = Vec::new();
        match self.source.sample(now) {
            Some(value) => {
                if self.base.cached(self.cluster, self.attribute) != Some(value) {
                    changes.push(self.base.cache_store(self.cluster, self.attribute, value));
                }
                changes.extend(self.base.set_reachable(true));
            }
            None => changes.extend(self.base.set_reachable(false)),
        }
        changes
    }

    fn arm_tick<C: Central>(&mut self, ctx: &DeviceCtx<'_, C>) {
        self.tick_generation += 1;
        schedule_event(
            ctx.events,
            self.refresh,
            BridgeEvent::ComputedTick {
                index: self.base.index(),
                generation: self.tick_generation,
            },
        );
    }

    /// Reads from the modeled cluster: fixed constants, then the cache
    /// with a zero default so a not-yet-sampled device never faults the
    /// server.
    ///
    /// # Errors
    ///
    /// [`BridgeError::BufferTooSmall`] when the value does not fit.
    pub fn read_mapped(
        &self,
        cluster: ClusterId,
        attribute: AttributeId,
        max_len: usize,
    ) -> Result<Vec<u8>, BridgeError> {
        if let Some(result) = read_modeled_constant(attribute, max_len) {
            return result;
        }
        let value = self.base.cached(cluster, attribute).unwrap_or(0);
        fit(value.to_le_bytes().to_vec(), max_len)
    }
}
