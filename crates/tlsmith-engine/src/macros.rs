//! Internal macros shared by the unit implementations.

/// The object-safety helpers every [`ProtocolUnit`](crate::unit::ProtocolUnit)
/// implementation needs. Expands inside an `impl ProtocolUnit for T` block of
/// a `Clone + 'static` type. The `registered` form also supplies `kind` and
/// `name` from [`RegisteredUnit`](crate::unit::RegisteredUnit).
macro_rules! unit_boilerplate {
    (registered) => {
        fn kind(&self) -> $crate::unit::UnitKind {
            <Self as $crate::unit::RegisteredUnit>::KIND
        }

        fn name(&self) -> &'static str {
            <Self as $crate::unit::RegisteredUnit>::NAME
        }

        unit_boilerplate!();
    };
    () => {
        fn clone_unit(&self) -> Box<dyn $crate::unit::ProtocolUnit> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    };
}
