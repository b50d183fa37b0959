use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Hard cap on every `TelemetryPlan` field after union.
pub const MAX_TELEMETRY_FIELD: usize = 10;

/// Floor for any user-supplied polling/streaming period.
pub const MIN_PERIOD_MS: u64 = 50;

/// One user's declarative subscription to a robot's fast channel: which
/// digital/group inputs and outputs, numeric registers and named
/// variables the device should stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPlan {
    #[serde(default)]
    pub di: Vec<u16>,
    #[serde(default)]
    pub gi: Vec<u16>,
    #[serde(default)]
    pub go: Vec<u16>,
    #[serde(default, rename = "do")]
    pub do_: Vec<u16>,
    #[serde(default)]
    pub r: Vec<u16>,
    #[serde(default)]
    pub var: Vec<String>,
    /// Requested streaming tick; the fastest requested period wins in
    /// the union, clamped to [`MIN_PERIOD_MS`].
    #[serde(default, rename = "periodMs", skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
}

impl TelemetryPlan {
    pub fn is_empty(&self) -> bool {
        self.di.is_empty()
            && self.gi.is_empty()
            && self.go.is_empty()
            && self.do_.is_empty()
            && self.r.is_empty()
            && self.var.is_empty()
    }

    /// Deterministic union of a set of user plans.
    ///
    /// Per field: union all contributions, drop non-positive indices and
    /// blank names, dedupe, sort ascending, truncate to
    /// [`MAX_TELEMETRY_FIELD`]. The result depends only on the multiset
    /// of plans, never on insertion order.
    pub fn union<'a, I>(plans: I) -> TelemetryPlan
    where
        I: IntoIterator<Item = &'a TelemetryPlan> + Clone,
    {
        let field = |pick: fn(&TelemetryPlan) -> &Vec<u16>| -> Vec<u16> {
            let set: BTreeSet<u16> = plans
                .clone()
                .into_iter()
                .flat_map(|p| pick(p).iter().copied())
                .filter(|&v| v > 0)
                .collect();
            set.into_iter().take(MAX_TELEMETRY_FIELD).collect()
        };

        let var: BTreeSet<String> = plans
            .clone()
            .into_iter()
            .flat_map(|p| p.var.iter())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();

        let period_ms = plans
            .clone()
            .into_iter()
            .filter_map(|p| p.period_ms)
            .min()
            .map(|p| p.max(MIN_PERIOD_MS));

        TelemetryPlan {
            di: field(|p| &p.di),
            gi: field(|p| &p.gi),
            go: field(|p| &p.go),
            do_: field(|p| &p.do_),
            r: field(|p| &p.r),
            var: var.into_iter().take(MAX_TELEMETRY_FIELD).collect(),
            period_ms,
        }
    }
}

/// One machine-data item: a tag path plus an optional expansion mode
/// (`"udt"` reads the tag's member list into a struct value).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanItem {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<String>,
}

impl PlanItem {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            expand: None,
        }
    }

    pub fn expanded(path: impl Into<String>, expand: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            expand: Some(expand.into()),
        }
    }

    fn normalized(&self) -> Option<PlanItem> {
        let path = self.path.trim();
        if path.is_empty() {
            return None;
        }
        let expand = self
            .expand
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        Some(PlanItem {
            path: path.to_string(),
            expand,
        })
    }

    fn dedup_key(&self) -> (String, String) {
        (
            self.path.to_ascii_lowercase(),
            self.expand
                .as_deref()
                .unwrap_or_default()
                .to_ascii_lowercase(),
        )
    }
}

/// One user's declarative subscription to a PLC's tag space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDataPlan {
    #[serde(default)]
    pub items: Vec<PlanItem>,
    /// Requested soft-pace period; fastest wins in the union, clamped
    /// to [`MIN_PERIOD_MS`].
    #[serde(default, rename = "periodMs", skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
}

impl MachineDataPlan {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Deterministic union: trim paths, drop empties, dedupe on
    /// `(path, expand-or-empty)` case-insensitively, sort by path then
    /// expand (ordinal-ignore-case, exact string as tie break),
    /// truncate to `max_items`.
    pub fn union<'a, I>(plans: I, max_items: usize) -> MachineDataPlan
    where
        I: IntoIterator<Item = &'a MachineDataPlan> + Clone,
    {
        let mut items: Vec<PlanItem> = plans
            .clone()
            .into_iter()
            .flat_map(|p| p.items.iter())
            .filter_map(PlanItem::normalized)
            .collect();

        items.sort_by(|a, b| {
            a.dedup_key()
                .cmp(&b.dedup_key())
                .then_with(|| (&a.path, &a.expand).cmp(&(&b.path, &b.expand)))
        });
        items.dedup_by(|a, b| a.dedup_key() == b.dedup_key());
        items.truncate(max_items);

        let period_ms = plans
            .into_iter()
            .filter_map(|p| p.period_ms)
            .min()
            .map(|p| p.max(MIN_PERIOD_MS));

        MachineDataPlan { items, period_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_union_merges_sorts_and_dedupes() {
        // Two-user union from the gateway contract: A={DI:[105], GI:[1],
        // GO:[1]}, B={DI:[113,105], GI:[2]}.
        let a = TelemetryPlan {
            di: vec![105],
            gi: vec![1],
            go: vec![1],
            ..Default::default()
        };
        let b = TelemetryPlan {
            di: vec![113, 105],
            gi: vec![2],
            ..Default::default()
        };
        let u = TelemetryPlan::union([&a, &b]);
        assert_eq!(u.di, vec![105, 113]);
        assert_eq!(u.gi, vec![1, 2]);
        assert_eq!(u.go, vec![1]);
        assert!(u.do_.is_empty() && u.r.is_empty() && u.var.is_empty());
    }

    #[test]
    fn telemetry_union_is_order_independent() {
        let a = TelemetryPlan {
            di: vec![9, 3],
            var: vec!["SPEED".into(), " mode ".into()],
            ..Default::default()
        };
        let b = TelemetryPlan {
            di: vec![3, 1],
            var: vec!["mode".into()],
            ..Default::default()
        };
        assert_eq!(TelemetryPlan::union([&a, &b]), TelemetryPlan::union([&b, &a]));
        let u = TelemetryPlan::union([&a, &b]);
        assert_eq!(u.di, vec![1, 3, 9]);
        // " mode " trims to "mode" and collapses with b's entry
        assert_eq!(u.var, vec!["SPEED".to_string(), "mode".to_string()]);
    }

    #[test]
    fn telemetry_union_drops_non_positive_and_caps() {
        let a = TelemetryPlan {
            di: (0..30).collect(),
            var: vec!["".into(), "  ".into()],
            ..Default::default()
        };
        let u = TelemetryPlan::union([&a]);
        assert_eq!(u.di.len(), MAX_TELEMETRY_FIELD);
        assert_eq!(u.di, (1..=10).collect::<Vec<u16>>());
        assert!(u.var.is_empty());
    }

    #[test]
    fn telemetry_union_takes_fastest_period_clamped() {
        let a = TelemetryPlan {
            period_ms: Some(20),
            ..Default::default()
        };
        let b = TelemetryPlan {
            period_ms: Some(100),
            ..Default::default()
        };
        assert_eq!(TelemetryPlan::union([&a, &b]).period_ms, Some(MIN_PERIOD_MS));
        assert_eq!(TelemetryPlan::union([&b]).period_ms, Some(100));
        let none: [&TelemetryPlan; 0] = [];
        assert_eq!(TelemetryPlan::union(none).period_ms, None);
    }

    #[test]
    fn machine_union_dedupes_case_insensitively() {
        let a = MachineDataPlan {
            items: vec![
                PlanItem::new("Station1Status "),
                PlanItem::expanded("Line.Speed", "udt"),
            ],
            period_ms: None,
        };
        let b = MachineDataPlan {
            items: vec![
                PlanItem::new("station1status"),
                PlanItem::new(""),
                PlanItem::expanded("Line.Speed", "UDT"),
            ],
            period_ms: None,
        };
        let u = MachineDataPlan::union([&a, &b], 50);
        assert_eq!(u.items.len(), 2);
        assert_eq!(u.items[0].path, "Line.Speed");
        assert_eq!(u.items[0].expand.as_deref(), Some("udt"));
        assert_eq!(u.items[1].path.to_ascii_lowercase(), "station1status");
        assert_eq!(MachineDataPlan::union([&a, &b], 50), MachineDataPlan::union([&b, &a], 50));
    }

    #[test]
    fn machine_union_truncates_to_max_items() {
        let plan = MachineDataPlan {
            items: (0..60).map(|i| PlanItem::new(format!("Tag{i:03}"))).collect(),
            period_ms: None,
        };
        let u = MachineDataPlan::union([&plan], 50);
        assert_eq!(u.items.len(), 50);
    }

    #[test]
    fn blank_expand_normalizes_to_none() {
        let plan = MachineDataPlan {
            items: vec![PlanItem::expanded("T", "  ")],
            period_ms: None,
        };
        let u = MachineDataPlan::union([&plan], 50);
        assert_eq!(u.items[0].expand, None);
    }
}
