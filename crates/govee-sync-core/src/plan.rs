//! Splitting merged commands into remote API calls.
//!
//! Some device models accept every attribute in one call, others need power
//! separated from color, and some vendor APIs take a single capability per
//! request. Which applies is configuration: a list of [`SplitRule`]s keyed
//! by model prefix, with a fallback for everything else.
//!
//! Calls are counted in capabilities, not attributes: settings that share an
//! [`Attribute::anchor`] (the music settings) always travel together.

use crate::api::Command;
use crate::batch::MergedCommand;
use crate::model::{Attribute, AttributeValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How calls are split for one model family.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitRule {
    /// Model prefix this rule applies to; `None` matches every model
    pub sku_prefix: Option<String>,
    /// Cap on capabilities per call; `None` means unlimited
    pub max_attributes_per_call: Option<usize>,
    /// Attributes that always travel in a call of their own
    pub isolated: Vec<Attribute>,
    /// Start a new call at every stage boundary (power, light, extras)
    pub split_stages: bool,
    /// Skip sending power on when light values are sent too, since the
    /// device switches itself on for them
    pub power_implied_by_light: bool,
}

impl SplitRule {
    /// Everything in one call.
    #[must_use]
    pub fn combined() -> Self {
        Self::default()
    }

    /// One attribute per call.
    #[must_use]
    pub fn one_per_call() -> Self {
        Self {
            max_attributes_per_call: Some(1),
            ..Self::default()
        }
    }

    /// One capability per call, with power on folded into light values.
    ///
    /// This is what the Govee control endpoint needs.
    #[must_use]
    pub fn single_capability() -> Self {
        Self {
            power_implied_by_light: true,
            ..Self::one_per_call()
        }
    }

    fn matches(&self, sku: &str) -> bool {
        self.sku_prefix
            .as_deref()
            .map_or(true, |prefix| sku.starts_with(prefix))
    }

    fn specificity(&self) -> usize {
        self.sku_prefix.as_ref().map_or(0, String::len)
    }
}

/// Chooses a [`SplitRule`] per model and applies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPlanner {
    rules: Vec<SplitRule>,
    fallback: SplitRule,
}

impl Default for CallPlanner {
    fn default() -> Self {
        Self::new(Vec::new(), SplitRule::combined())
    }
}

impl CallPlanner {
    /// Create a planner from model rules and a fallback.
    #[must_use]
    pub fn new(rules: Vec<SplitRule>, fallback: SplitRule) -> Self {
        Self { rules, fallback }
    }

    /// The most specific rule matching `sku`.
    #[must_use]
    pub fn rule_for(&self, sku: &str) -> &SplitRule {
        self.rules
            .iter()
            .filter(|rule| rule.matches(sku))
            .max_by_key(|rule| rule.specificity())
            .unwrap_or(&self.fallback)
    }

    /// Move a power-on that light values already imply out of the sent
    /// values, when the model's rule asks for it. The power value is still
    /// applied locally. Returns `true` if power was folded.
    pub fn fold_implied_power(&self, sku: &str, merged: &mut MergedCommand) -> bool {
        if !self.rule_for(sku).power_implied_by_light {
            return false;
        }
        let has_light = merged.values.keys().any(Attribute::implies_power_on);
        if !has_light || merged.values.get(&Attribute::Power) != Some(&AttributeValue::Switch(true))
        {
            return false;
        }
        if let Some(power) = merged.values.remove(&Attribute::Power) {
            merged.local.insert(Attribute::Power, power);
        }
        true
    }

    /// Split `values` into calls, preserving send order
    /// (power, then light, then extras).
    #[must_use]
    pub fn plan(&self, sku: &str, values: &BTreeMap<Attribute, AttributeValue>) -> Vec<Command> {
        let rule = self.rule_for(sku);
        let max = rule.max_attributes_per_call.unwrap_or(usize::MAX).max(1);

        let mut calls = Vec::new();
        let mut current: BTreeMap<Attribute, AttributeValue> = BTreeMap::new();
        let mut current_units = 0;
        let mut current_stage = None;

        for unit in units(values) {
            let Some(anchor) = unit.keys().next().map(Attribute::anchor) else {
                continue;
            };
            if unit.keys().any(|attr| rule.isolated.contains(attr)) {
                flush(&mut calls, &mut current);
                calls.push(Command { values: unit });
                current_units = 0;
                current_stage = None;
                continue;
            }

            let stage = anchor.stage();
            let stage_changed = current_stage.is_some_and(|s| s != stage);
            if current_units >= max || (rule.split_stages && stage_changed) {
                flush(&mut calls, &mut current);
                current_units = 0;
            }
            current.extend(unit);
            current_units += 1;
            current_stage = Some(stage);
        }
        flush(&mut calls, &mut current);

        calls
    }
}

/// Group values sharing an anchor. Grouped attributes sort next to each
/// other, so runs of equal anchors are the units.
fn units(
    values: &BTreeMap<Attribute, AttributeValue>,
) -> Vec<BTreeMap<Attribute, AttributeValue>> {
    let mut units: Vec<BTreeMap<Attribute, AttributeValue>> = Vec::new();
    let mut last_anchor = None;
    for (attribute, value) in values {
        let anchor = attribute.anchor();
        match units.last_mut() {
            Some(unit) if last_anchor == Some(anchor) => {
                unit.insert(*attribute, value.clone());
            }
            _ => units.push(BTreeMap::from([(*attribute, value.clone())])),
        }
        last_anchor = Some(anchor);
    }
    units
}

fn flush(calls: &mut Vec<Command>, current: &mut BTreeMap<Attribute, AttributeValue>) {
    if !current.is_empty() {
        calls.push(Command {
            values: std::mem::take(current),
        });
    }
}
