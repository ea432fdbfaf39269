//! Process-variable inputs

use serde::{Deserialize, Serialize};

/// Physical meaning of the value produced by an [`InputSource`].
///
/// The controller integrates differently depending on the kind: a rate input
/// accumulates error into the proportional term, while a displacement input
/// uses the textbook PID form.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceKind {
    /// A position-like quantity (angle, distance, ...)
    #[default]
    Displacement,

    /// A velocity-like quantity (angular rate, RPM, ...)
    Rate,
}

/// Something that can be sampled for the current process variable.
pub trait InputSource: Send {
    /// Sample the current value.
    ///
    /// Called without any controller lock held, so it may query the
    /// controller it feeds. It must not call that controller's `error` or
    /// `set_source_kind`, which sample the source themselves.
    fn read(&mut self) -> f64;

    /// Which kind of quantity `read` reports.
    fn kind(&self) -> SourceKind;

    /// Select which kind of quantity `read` should report.
    ///
    /// Sensors that can report both (a gyro reporting angle or rate, an
    /// encoder reporting distance or speed) switch their output here.
    fn set_kind(&mut self, kind: SourceKind);
}

/// Adapter that presents a plain closure as an [`InputSource`].
///
/// The closure always produces the same quantity, so the kind is only a
/// label that the controller uses to pick its integration mode.
pub struct FnSource<F> {
    read: F,
    kind: SourceKind,
}

impl<F> FnSource<F>
where
    F: FnMut() -> f64 + Send,
{
    /// Wrap a closure reporting a displacement.
    pub fn new(read: F) -> Self {
        Self::with_kind(read, SourceKind::Displacement)
    }

    /// Wrap a closure with an explicit kind.
    pub fn with_kind(read: F, kind: SourceKind) -> Self {
        Self { read, kind }
    }
}

impl<F> InputSource for FnSource<F>
where
    F: FnMut() -> f64 + Send,
{
    fn read(&mut self) -> f64 {
        (self.read)()
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn set_kind(&mut self, kind: SourceKind) {
        self.kind = kind;
    }
}

impl<T: InputSource + ?Sized> InputSource for Box<T> {
    fn read(&mut self) -> f64 {
        (**self).read()
    }

    fn kind(&self) -> SourceKind {
        (**self).kind()
    }

    fn set_kind(&mut self, kind: SourceKind) {
        (**self).set_kind(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_source_reads_closure() {
        let mut n = 0.0;
        let mut source = FnSource::new(move || {
            n += 1.0;
            n
        });

        assert_eq!(source.read(), 1.0);
        assert_eq!(source.read(), 2.0);
        assert_eq!(source.kind(), SourceKind::Displacement);
    }

    #[test]
    fn fn_source_kind_is_mutable() {
        let mut source = FnSource::with_kind(|| 3.0, SourceKind::Rate);
        assert_eq!(source.kind(), SourceKind::Rate);

        source.set_kind(SourceKind::Displacement);
        assert_eq!(source.kind(), SourceKind::Displacement);
    }

    #[test]
    fn boxed_source_delegates() {
        let mut source: Box<dyn InputSource> = Box::new(FnSource::new(|| 7.5));
        source.set_kind(SourceKind::Rate);

        assert_eq!(source.read(), 7.5);
        assert_eq!(source.kind(), SourceKind::Rate);
    }

    #[test]
    fn source_kind_serializes_by_name() {
        let s = serde_json::to_string(&SourceKind::Rate).unwrap();
        assert_eq!(s, "\"Rate\"");
        let kind: SourceKind = serde_json::from_str("\"Displacement\"").unwrap();
        assert_eq!(kind, SourceKind::Displacement);
    }
}
