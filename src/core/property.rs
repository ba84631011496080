//! The six evaluable note properties and their DSL/legacy spellings.

use std::fmt;

use crate::core::error::CoreError;

/// One of the six properties a note's expressions can target.
///
/// The discriminant order is load-bearing: it is the VM variable index
/// used by `LOAD_REF`/`LOAD_BASE` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    /// Note start time, in seconds.
    StartTime = 0,
    /// Note duration, in seconds.
    Duration = 1,
    /// Note frequency, in Hz.
    Frequency = 2,
    /// Tempo, in beats per minute.
    Tempo = 3,
    /// Beats per measure (time signature numerator).
    BeatsPerMeasure = 4,
    /// Derived measure length, in seconds.
    MeasureLength = 5,
}

/// All six properties, in VM variable-index order.
pub const ALL_PROPERTIES: [Property; 6] = [
    Property::StartTime,
    Property::Duration,
    Property::Frequency,
    Property::Tempo,
    Property::BeatsPerMeasure,
    Property::MeasureLength,
];

impl Property {
    /// The VM variable index (0..=5) for this property.
    #[must_use]
    pub fn var_index(self) -> u8 {
        self as u8
    }

    /// Look up a property by its VM variable index.
    ///
    /// # Errors
    /// Returns `CoreError::MalformedBytecode` for any index above 5.
    pub fn from_var_index(idx: u8) -> Result<Self, CoreError> {
        match idx {
            0 => Ok(Property::StartTime),
            1 => Ok(Property::Duration),
            2 => Ok(Property::Frequency),
            3 => Ok(Property::Tempo),
            4 => Ok(Property::BeatsPerMeasure),
            5 => Ok(Property::MeasureLength),
            other => Err(CoreError::MalformedBytecode {
                msg: format!("variable index {other} out of range 0..=5"),
            }),
        }
    }

    /// Resolve a property by one of its DSL short names, long aliases,
    /// or legacy `getVariable('...')` argument spellings.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "f" | "frequency" => Some(Property::Frequency),
            "t" | "startTime" => Some(Property::StartTime),
            "d" | "duration" => Some(Property::Duration),
            "tempo" => Some(Property::Tempo),
            "bpm" | "beatsPerMeasure" => Some(Property::BeatsPerMeasure),
            "ml" | "measureLength" => Some(Property::MeasureLength),
            _ => None,
        }
    }

    /// The canonical short DSL spelling (`f`, `t`, `d`, `tempo`, `bpm`,
    /// `ml`).
    #[must_use]
    pub fn short_name(self) -> &'static str {
        match self {
            Property::Frequency => "f",
            Property::StartTime => "t",
            Property::Duration => "d",
            Property::Tempo => "tempo",
            Property::BeatsPerMeasure => "bpm",
            Property::MeasureLength => "ml",
        }
    }

    /// The JSON document field name.
    #[must_use]
    pub fn json_field(self) -> &'static str {
        match self {
            Property::Frequency => "frequency",
            Property::StartTime => "startTime",
            Property::Duration => "duration",
            Property::Tempo => "tempo",
            Property::BeatsPerMeasure => "beatsPerMeasure",
            Property::MeasureLength => "measureLength",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_index_round_trips() {
        for p in ALL_PROPERTIES {
            assert_eq!(Property::from_var_index(p.var_index()).expect("valid"), p);
        }
    }

    #[test]
    fn aliases_resolve_to_same_property() {
        assert_eq!(Property::from_name("f"), Property::from_name("frequency"));
        assert_eq!(Property::from_name("bpm"), Property::from_name("beatsPerMeasure"));
    }

    #[test]
    fn unknown_name_is_none() {
        assert_eq!(Property::from_name("nope"), None);
    }
}
