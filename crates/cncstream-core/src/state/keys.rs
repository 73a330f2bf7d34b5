use crate::data::Axis;

/// Named telemetry keys
///
/// Names follow the conventional short forms used in G-code macros:
/// `wx`..`wc` work position, `mx`..`mc` machine position, `prbx`..`prbz`
/// probe contact, `OvFeed`/`OvRapid`/`OvSpindle` overrides, `TLO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    State,
    Work(Axis),
    Machine(Axis),
    Wco(Axis),
    Probe(Axis),
    ProbeContact,
    Feed,
    Spindle,
    OvFeed,
    OvRapid,
    OvSpindle,
    Tlo,
    Wcs,
    Motion,
    Tool,
    BoundsMin(Axis),
    BoundsMax(Axis),
}

impl StateKey {
    /// Resolve a key name
    pub fn from_name(name: &str) -> Option<Self> {
        let fixed = match name {
            "state" => Some(StateKey::State),
            "prbcontact" => Some(StateKey::ProbeContact),
            "curfeed" | "feed" => Some(StateKey::Feed),
            "curspindle" | "rpm" => Some(StateKey::Spindle),
            "OvFeed" => Some(StateKey::OvFeed),
            "OvRapid" => Some(StateKey::OvRapid),
            "OvSpindle" => Some(StateKey::OvSpindle),
            "TLO" => Some(StateKey::Tlo),
            "WCS" => Some(StateKey::Wcs),
            "motion" => Some(StateKey::Motion),
            "tool" => Some(StateKey::Tool),
            _ => None,
        };
        if fixed.is_some() {
            return fixed;
        }
        let axis_of = |rest: &str| {
            let mut chars = rest.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Axis::from_letter(c).filter(|_| c.is_ascii_lowercase()),
                _ => None,
            }
        };
        if let Some(rest) = name.strip_prefix("prb") {
            return axis_of(rest).map(StateKey::Probe);
        }
        if let Some(rest) = name.strip_prefix("wco") {
            return axis_of(rest).map(StateKey::Wco);
        }
        if let Some(rest) = name.strip_suffix("min") {
            return axis_of(rest).map(StateKey::BoundsMin);
        }
        if let Some(rest) = name.strip_suffix("max") {
            return axis_of(rest).map(StateKey::BoundsMax);
        }
        if let Some(rest) = name.strip_prefix('w') {
            return axis_of(rest).map(StateKey::Work);
        }
        if let Some(rest) = name.strip_prefix('m') {
            return axis_of(rest).map(StateKey::Machine);
        }
        None
    }

    /// Canonical name of the key
    pub fn name(&self) -> String {
        match self {
            StateKey::State => "state".into(),
            StateKey::Work(a) => format!("w{}", a.letter()),
            StateKey::Machine(a) => format!("m{}", a.letter()),
            StateKey::Wco(a) => format!("wco{}", a.letter()),
            StateKey::Probe(a) => format!("prb{}", a.letter()),
            StateKey::ProbeContact => "prbcontact".into(),
            StateKey::Feed => "curfeed".into(),
            StateKey::Spindle => "curspindle".into(),
            StateKey::OvFeed => "OvFeed".into(),
            StateKey::OvRapid => "OvRapid".into(),
            StateKey::OvSpindle => "OvSpindle".into(),
            StateKey::Tlo => "TLO".into(),
            StateKey::Wcs => "WCS".into(),
            StateKey::Motion => "motion".into(),
            StateKey::Tool => "tool".into(),
            StateKey::BoundsMin(a) => format!("{}min", a.letter()),
            StateKey::BoundsMax(a) => format!("{}max", a.letter()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for name in ["wx", "mz", "prbz", "wcoy", "xmin", "zmax", "TLO", "OvFeed", "state"] {
            let key = StateKey::from_name(name).unwrap();
            assert_eq!(StateKey::from_name(&key.name()), Some(key));
        }
    }

    #[test]
    fn test_non_keys() {
        for name in ["toolheight", "toolmz", "w", "wxx", "Wx", "prb", "_x", "mq"] {
            assert_eq!(StateKey::from_name(name), None, "{name}");
        }
    }
}
