//! Named settle waits
//!
//! The control plane does not always reflect a finished mutation on the very
//! next read. Each place where the engine tolerates that gap is a
//! [`SettlePoint`]; its delay comes from [`SettlePolicy`] and may be zero.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::context::ReconcileContext;
use crate::config::duration_secs;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettlePoint {
    AfterCreate,
    AfterRoleChange,
    AfterStateChange,
    AfterApplianceUpdate,
    AfterMaintenance,
}

impl fmt::Display for SettlePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlePoint::AfterCreate => write!(f, "after create"),
            SettlePoint::AfterRoleChange => write!(f, "after role change"),
            SettlePoint::AfterStateChange => write!(f, "after state change"),
            SettlePoint::AfterApplianceUpdate => write!(f, "after appliance update"),
            SettlePoint::AfterMaintenance => write!(f, "after maintenance"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SettlePolicy {
    #[serde(rename = "after_create_secs", with = "duration_secs")]
    pub after_create: Duration,
    #[serde(rename = "after_role_change_secs", with = "duration_secs")]
    pub after_role_change: Duration,
    #[serde(rename = "after_state_change_secs", with = "duration_secs")]
    pub after_state_change: Duration,
    #[serde(rename = "after_appliance_update_secs", with = "duration_secs")]
    pub after_appliance_update: Duration,
    #[serde(rename = "after_maintenance_secs", with = "duration_secs")]
    pub after_maintenance: Duration,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            after_create: Duration::from_secs(5),
            after_role_change: Duration::from_secs(5),
            after_state_change: Duration::from_secs(10),
            after_appliance_update: Duration::from_secs(5),
            after_maintenance: Duration::from_secs(10),
        }
    }
}

impl SettlePolicy {
    /// No settle waits at all
    pub fn none() -> Self {
        Self {
            after_create: Duration::ZERO,
            after_role_change: Duration::ZERO,
            after_state_change: Duration::ZERO,
            after_appliance_update: Duration::ZERO,
            after_maintenance: Duration::ZERO,
        }
    }

    pub fn delay(&self, point: SettlePoint) -> Duration {
        match point {
            SettlePoint::AfterCreate => self.after_create,
            SettlePoint::AfterRoleChange => self.after_role_change,
            SettlePoint::AfterStateChange => self.after_state_change,
            SettlePoint::AfterApplianceUpdate => self.after_appliance_update,
            SettlePoint::AfterMaintenance => self.after_maintenance,
        }
    }
}

pub async fn settle(ctx: &ReconcileContext, point: SettlePoint) -> Result<()> {
    let delay = ctx.config().settle.delay(point);
    if delay.is_zero() {
        return Ok(());
    }
    debug!(point = %point, delay_ms = delay.as_millis() as u64, "Settling");
    ctx.pause(delay, &format!("settle {point}")).await
}
