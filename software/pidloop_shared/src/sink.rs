//! Correction-signal outputs

/// Something that accepts the controller's correction signal,
/// usually a motor controller or other actuator.
pub trait OutputSink: Send {
    /// Apply a new output value.
    ///
    /// Called without any controller lock held. A value submitted from inside
    /// `write`, such as the zero from disabling the controller, is written
    /// right after this call returns.
    fn write(&mut self, value: f64);
}

/// Adapter that presents a plain closure as an [`OutputSink`].
pub struct FnSink<F> {
    write: F,
}

impl<F> FnSink<F>
where
    F: FnMut(f64) + Send,
{
    pub fn new(write: F) -> Self {
        Self { write }
    }
}

impl<F> OutputSink for FnSink<F>
where
    F: FnMut(f64) + Send,
{
    fn write(&mut self, value: f64) {
        (self.write)(value);
    }
}

impl<T: OutputSink + ?Sized> OutputSink for Box<T> {
    fn write(&mut self, value: f64) {
        (**self).write(value);
    }
}
