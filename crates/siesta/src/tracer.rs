//! Diagnostic tracing hooks.
//!
//! Internal diagnostics are events handed to a `Tracer`; the context's
//! `debug` level selects one. `NoopTracer` compiles away in release use;
//! `StderrTracer` prints each event as a line.

/// An internal diagnostic event.
#[derive(Debug)]
pub enum TraceEvent<'a> {
    /// A compile stage finished for the named unit.
    Stage { stage: &'a str, unit: &'a str },
    /// Execution suspended at a numbered location in a function.
    Suspend { function: &'a str, location: u32 },
    /// A continuation chain resumed with `depth` saved frames.
    Resume { depth: usize },
}

/// Receives diagnostic events.
pub trait Tracer {
    fn event(&mut self, event: TraceEvent<'_>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn event(&mut self, _event: TraceEvent<'_>) {}
}

/// Writes one line per event to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrTracer;

impl Tracer for StderrTracer {
    fn event(&mut self, event: TraceEvent<'_>) {
        match event {
            TraceEvent::Stage { stage, unit } => eprintln!("[siesta] {stage}: {unit}"),
            TraceEvent::Suspend { function, location } => {
                eprintln!("[siesta] suspend in {function} at location {location}");
            }
            TraceEvent::Resume { depth } => eprintln!("[siesta] resume chain of {depth}"),
        }
    }
}
