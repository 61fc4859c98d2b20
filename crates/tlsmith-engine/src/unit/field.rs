//! Typed unit fields with an override slot.
//!
//! Every wire field of every unit is a [`Field`]. The value slot is filled by
//! decode or compute-defaults; the override slot is the test-injection point.
//! One merge rule applies everywhere, see [`Field::get`].

use std::fmt;

use tlsmith_types::EngineError;

/// Values that can live in a [`Field`].
pub trait FieldValue: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Combine this value with an xor mask.
    fn xor_mask(&self, mask: &Self) -> Self;
}

macro_rules! int_field_value {
    ($($t:ty),*) => {
        $(impl FieldValue for $t {
            fn xor_mask(&self, mask: &Self) -> Self {
                self ^ mask
            }
        })*
    };
}

int_field_value!(u8, u16, u32, u64);

impl FieldValue for Vec<u8> {
    /// Byte-wise xor; the mask is repeated over longer values.
    fn xor_mask(&self, mask: &Self) -> Self {
        if mask.is_empty() {
            return self.clone();
        }
        self.iter()
            .zip(mask.iter().cycle())
            .map(|(b, m)| b ^ m)
            .collect()
    }
}

impl FieldValue for Vec<u16> {
    fn xor_mask(&self, mask: &Self) -> Self {
        if mask.is_empty() {
            return self.clone();
        }
        self.iter()
            .zip(mask.iter().cycle())
            .map(|(v, m)| v ^ m)
            .collect()
    }
}

/// A forced field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override<T> {
    /// Emit exactly this value.
    Explicit(T),
    /// Emit the computed or parsed value xored with this mask.
    Xor(T),
}

/// One wire field: an optional computed/parsed value plus an optional override.
#[derive(Clone, PartialEq)]
pub struct Field<T> {
    value: Option<T>,
    forced: Option<Override<T>>,
}

impl<T: FieldValue> Field<T> {
    pub fn new() -> Self {
        Self {
            value: None,
            forced: None,
        }
    }

    /// A field holding a decoded or hand-set value.
    pub fn with_value(value: T) -> Self {
        Self {
            value: Some(value),
            forced: None,
        }
    }

    /// A field whose value is forced regardless of state.
    pub fn explicit(value: T) -> Self {
        Self {
            value: None,
            forced: Some(Override::Explicit(value)),
        }
    }

    /// The value encode emits: an explicit override wins, an xor override
    /// applies to the underlying value, otherwise the underlying value.
    pub fn get(&self) -> Option<T> {
        match (&self.forced, &self.value) {
            (Some(Override::Explicit(v)), _) => Some(v.clone()),
            (Some(Override::Xor(mask)), Some(v)) => Some(v.xor_mask(mask)),
            (Some(Override::Xor(_)), None) => None,
            (None, v) => v.clone(),
        }
    }

    /// The computed or parsed value, ignoring any override.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn set(&mut self, value: T) {
        self.value = Some(value);
    }

    pub fn set_override(&mut self, forced: Override<T>) {
        self.forced = Some(forced);
    }

    /// Shorthand for `set_override(Override::Explicit(value))`.
    pub fn force(&mut self, value: T) {
        self.forced = Some(Override::Explicit(value));
    }

    pub fn clear_override(&mut self) {
        self.forced = None;
    }

    pub fn override_value(&self) -> Option<&Override<T>> {
        self.forced.as_ref()
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self.forced, Some(Override::Explicit(_)))
    }

    /// Store a computed default. The closure is not run while an explicit
    /// override is present.
    pub fn compute(&mut self, f: impl FnOnce() -> T) {
        if !self.is_explicit() {
            self.value = Some(f());
        }
    }

    /// Store a default only when the field holds neither a value nor an
    /// explicit override. Used for content fields a caller usually sets by
    /// hand (payloads, bodies).
    pub fn fill(&mut self, f: impl FnOnce() -> T) {
        if self.value.is_none() && !self.is_explicit() {
            self.value = Some(f());
        }
    }

    /// Fallible variant of [`Field::compute`].
    pub fn try_compute(
        &mut self,
        f: impl FnOnce() -> Result<T, EngineError>,
    ) -> Result<(), EngineError> {
        if !self.is_explicit() {
            self.value = Some(f()?);
        }
        Ok(())
    }

    /// The emitted value, or `MissingField` when nothing is set.
    pub fn require(&self, unit: &'static str, field: &'static str) -> Result<T, EngineError> {
        self.get().ok_or(EngineError::MissingField { unit, field })
    }
}

impl<T> Field<Vec<T>>
where
    Vec<T>: FieldValue,
{
    /// Length of the value encode emits. Xor overrides keep the length.
    pub fn emitted_len(&self) -> usize {
        match &self.forced {
            Some(Override::Explicit(v)) => v.len(),
            _ => self.value.as_ref().map_or(0, Vec::len),
        }
    }
}

impl<T: FieldValue> Default for Field<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.forced, &self.value) {
            (Some(forced), _) => write!(f, "{forced:?}"),
            (None, Some(v)) => write!(f, "{v:?}"),
            (None, None) => f.write_str("<unset>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_explicit_override_survives_compute() {
        let mut f = Field::<u16>::new();
        f.force(0xBEEF);
        let mut ran = false;
        f.compute(|| {
            ran = true;
            1
        });
        assert!(!ran);
        assert_eq!(f.get(), Some(0xBEEF));
        assert_eq!(f.value(), None);
    }

    #[test]
    fn test_xor_override_applies_to_computed_value() {
        let mut f = Field::<Vec<u8>>::new();
        f.set_override(Override::Xor(vec![0xFF]));
        assert_eq!(f.get(), None);
        f.compute(|| vec![0x00, 0x0F, 0xF0]);
        assert_eq!(f.get(), Some(vec![0xFF, 0xF0, 0x0F]));
        assert_eq!(f.value(), Some(&vec![0x00, 0x0F, 0xF0]));
    }

    #[test]
    fn test_clear_override_restores_value() {
        let mut f = Field::with_value(7u8);
        f.force(9);
        assert_eq!(f.get(), Some(9));
        f.clear_override();
        assert_eq!(f.get(), Some(7));
    }

    #[test]
    fn test_fill_keeps_existing_value() {
        let mut f = Field::with_value(vec![1u8, 2]);
        f.fill(|| vec![9]);
        assert_eq!(f.get(), Some(vec![1, 2]));
        let mut empty = Field::<Vec<u8>>::new();
        empty.fill(|| vec![9]);
        assert_eq!(empty.get(), Some(vec![9]));
    }

    #[test]
    fn test_require_reports_missing_field() {
        let f = Field::<u8>::new();
        match f.require("Alert", "level") {
            Err(EngineError::MissingField { unit, field }) => {
                assert_eq!(unit, "Alert");
                assert_eq!(field, "level");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_try_compute_propagates_error_and_skips_when_forced() {
        let mut f = Field::<u32>::new();
        let err = f.try_compute(|| Err(EngineError::Unsupported("x".into())));
        assert!(err.is_err());
        f.force(3);
        f.try_compute(|| Err(EngineError::Unsupported("x".into())))
            .unwrap();
        assert_eq!(f.get(), Some(3));
    }

    proptest! {
        #[test]
        fn prop_explicit_override_wins(computed in any::<u32>(), forced in any::<u32>()) {
            let mut f = Field::<u32>::new();
            f.force(forced);
            f.compute(|| computed);
            prop_assert_eq!(f.get(), Some(forced));
        }

        #[test]
        fn prop_compute_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut f = Field::<Vec<u8>>::new();
            f.compute(|| bytes.clone());
            let first = f.clone();
            f.compute(|| bytes.clone());
            prop_assert_eq!(first, f);
        }
    }
}
