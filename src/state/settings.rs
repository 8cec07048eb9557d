// Branch-overridable configuration with global/default fallback.

use anyhow::{Result, bail};
use mongodb::bson::{DateTime, doc, oid::ObjectId};
use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::models::{EffectiveSetting, SettingScope};

use super::AppState;

/// Closed set of configuration keys; anything else is rejected before any
/// write or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SettingKey {
    PenaltyRate,
    PenaltyGraceDays,
    FinalDropoffDays,
}

impl SettingKey {
    pub const ALL: &'static [SettingKey] = &[
        SettingKey::PenaltyRate,
        SettingKey::PenaltyGraceDays,
        SettingKey::FinalDropoffDays,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::PenaltyRate => "penalty_rate",
            SettingKey::PenaltyGraceDays => "penalty_grace_days",
            SettingKey::FinalDropoffDays => "final_dropoff_days",
        }
    }

    pub fn parse(key: &str) -> Result<SettingKey> {
        match key {
            "penalty_rate" => Ok(SettingKey::PenaltyRate),
            "penalty_grace_days" => Ok(SettingKey::PenaltyGraceDays),
            "final_dropoff_days" => Ok(SettingKey::FinalDropoffDays),
            other => bail!("unknown setting key: {other}"),
        }
    }

    pub fn default_value(&self) -> f64 {
        match self {
            SettingKey::PenaltyRate => 0.10,
            SettingKey::PenaltyGraceDays => 0.0,
            SettingKey::FinalDropoffDays => 30.0,
        }
    }

    /// Range check applied before any write.
    pub fn validate(&self, value: f64) -> Result<()> {
        match self {
            SettingKey::PenaltyRate => {
                if !(0.0..=1.0).contains(&value) {
                    bail!("penalty_rate must be between 0 and 1");
                }
            }
            SettingKey::PenaltyGraceDays | SettingKey::FinalDropoffDays => {
                if value < 0.0 || value.fract() != 0.0 {
                    bail!("{} must be a non-negative whole number of days", self.as_str());
                }
            }
        }
        Ok(())
    }
}

/// Penalty parameters the Delinquency Engine runs with, resolved fresh for
/// one branch on every invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelinquencyPolicy {
    pub penalty_rate: f64,
    pub grace_days: i64,
    pub dropoff_days: i64,
}

pub(super) fn effective_from(
    branch_value: Option<f64>,
    global_value: Option<f64>,
    default_value: f64,
) -> EffectiveSetting {
    if let Some(value) = branch_value {
        EffectiveSetting {
            value,
            scope: SettingScope::Branch,
        }
    } else if let Some(value) = global_value {
        EffectiveSetting {
            value,
            scope: SettingScope::Global,
        }
    } else {
        EffectiveSetting {
            value: default_value,
            scope: SettingScope::Default,
        }
    }
}

/// Resolve each key through branch override -> global -> code default,
/// reporting which tier supplied the value.
pub async fn get_effective_settings(
    state: &AppState,
    keys: &[SettingKey],
    branch_id: Option<&ObjectId>,
) -> Result<BTreeMap<String, EffectiveSetting>> {
    let mut resolved = BTreeMap::new();
    for key in keys {
        let branch_value = match branch_id {
            Some(branch) => state
                .settings
                .find_one(doc! { "key": key.as_str(), "branch_id": branch })
                .await?
                .map(|s| s.value),
            None => None,
        };
        let global_value = state
            .settings
            .find_one(doc! { "key": key.as_str(), "branch_id": null })
            .await?
            .map(|s| s.value);

        resolved.insert(
            key.as_str().to_string(),
            effective_from(branch_value, global_value, key.default_value()),
        );
    }
    Ok(resolved)
}

/// Write one setting at the branch tier (or global with `branch_id` None).
/// Key and range are validated before any write.
pub async fn upsert_setting(
    state: &AppState,
    key: &str,
    value: f64,
    branch_id: Option<&ObjectId>,
) -> Result<()> {
    let key = SettingKey::parse(key)?;
    key.validate(value)?;

    let filter = match branch_id {
        Some(branch) => doc! { "key": key.as_str(), "branch_id": branch },
        None => doc! { "key": key.as_str(), "branch_id": null },
    };
    state
        .settings
        .update_one(
            filter,
            doc! { "$set": {
                "key": key.as_str(),
                "value": value,
                "branch_id": branch_id,
                "updated_at": DateTime::from_system_time(SystemTime::now()),
            } },
        )
        .upsert(true)
        .await?;
    Ok(())
}

/// Typed read path for the Delinquency Engine.
pub async fn delinquency_policy(
    state: &AppState,
    branch_id: Option<&ObjectId>,
) -> Result<DelinquencyPolicy> {
    let resolved = get_effective_settings(state, SettingKey::ALL, branch_id).await?;
    let value = |key: SettingKey| {
        resolved
            .get(key.as_str())
            .map(|s| s.value)
            .unwrap_or_else(|| key.default_value())
    };
    Ok(DelinquencyPolicy {
        penalty_rate: value(SettingKey::PenaltyRate),
        grace_days: value(SettingKey::PenaltyGraceDays) as i64,
        dropoff_days: value(SettingKey::FinalDropoffDays) as i64,
    })
}
