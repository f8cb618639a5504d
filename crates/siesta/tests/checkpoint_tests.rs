//! Checkpointing: persisting a suspended execution through the host
//! callback and restoring it to the same final value.

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use siesta::{
    CheckpointRequest, CollectPrint, Context, Globals, RuntimeError, Script, Value,
};

/// A context whose checkpointer records every byte blob it is handed.
fn recording_context(store: Rc<RefCell<Vec<Vec<u8>>>>) -> Context {
    Context::new().with_checkpointer(Rc::new(move |request: CheckpointRequest| {
        store.borrow_mut().push(request.bytes);
        (request.resumer)(Ok(request.result));
    }))
}

fn run_with_checkpoints(source: &str) -> (Value, Vec<Vec<u8>>, Script, Context) {
    let store = Rc::new(RefCell::new(Vec::new()));
    let mut context = recording_context(store.clone());
    let script = Script::compile(source, "checkpointed", &mut context).unwrap();
    let mut bindings = Globals::new();
    let mut output = CollectPrint::new();
    let value = script
        .run_sync_with_output(&mut bindings, &context, &mut output)
        .unwrap();
    let blobs = store.borrow().clone();
    (value, blobs, script, context)
}

// ============================================================================
// the persistence callback
// ============================================================================

#[test]
fn checkpoint_invokes_the_host_callback() {
    let (value, blobs, _script, _context) = run_with_checkpoints("def x = 5; checkpoint(); x + 2");
    assert_eq!(value.display_string(), "7");
    assert_eq!(blobs.len(), 1);
    assert!(!blobs[0].is_empty());
}

#[test]
fn checkpoint_without_a_callback_is_a_no_op() {
    let mut context = Context::new();
    let mut bindings = Globals::new();
    let value = siesta::eval("def x = 1; checkpoint(); x + 1", &mut bindings, &mut context).unwrap();
    assert_eq!(value.display_string(), "2");
}

#[test]
fn checkpoint_metadata_counts_up() {
    let ids = Rc::new(RefCell::new(Vec::new()));
    let ids_inner = ids.clone();
    let mut context = Context::new().with_checkpointer(Rc::new(move |request: CheckpointRequest| {
        ids_inner.borrow_mut().push(request.checkpoint_id);
        assert!(!request.uuid.is_empty());
        (request.resumer)(Ok(request.result));
    }));
    let mut bindings = Globals::new();
    siesta::eval("checkpoint(); checkpoint(); checkpoint()", &mut bindings, &mut context).unwrap();
    assert_eq!(&*ids.borrow(), &[1, 2, 3]);
}

#[test]
fn persistence_failure_surfaces_as_runtime_error() {
    let mut context = Context::new().with_checkpointer(Rc::new(|request: CheckpointRequest| {
        (request.resumer)(Err(RuntimeError::general("disk full")));
    }));
    let mut bindings = Globals::new();
    let err = siesta::eval("checkpoint(); 1", &mut bindings, &mut context).unwrap_err();
    assert!(err.to_string().contains("disk full"), "{err}");
}

// ============================================================================
// restore round-trips
// ============================================================================

#[test]
fn restored_checkpoint_produces_the_same_value() {
    let source = "def x = 5; def y = checkpoint(); x + 2";
    let (value, blobs, script, context) = run_with_checkpoints(source);
    assert_eq!(value.display_string(), "7");

    let mut bindings = Globals::new();
    let mut output = CollectPrint::new();
    let restored = script
        .restore(&blobs[0], &mut bindings, &context, &mut output)
        .unwrap();
    assert!(value.loose_eq(&restored), "{value} vs {restored}");
}

#[test]
fn restore_rebuilds_nested_frames() {
    let source = "def f(int n) { checkpoint(); n * 2 }\n\
                  def g(int n) { f(n) + 1 }\n\
                  g(10) + 100";
    let (value, blobs, script, context) = run_with_checkpoints(source);
    assert_eq!(value.display_string(), "121");

    let mut bindings = Globals::new();
    let mut output = CollectPrint::new();
    let restored = script
        .restore(&blobs[0], &mut bindings, &context, &mut output)
        .unwrap();
    assert_eq!(restored.display_string(), "121");
}

#[test]
fn restore_replays_only_the_suffix() {
    let source = "print 'before'; checkpoint(); print 'after'; 9";
    let (value, blobs, script, context) = run_with_checkpoints(source);
    assert_eq!(value.display_string(), "9");

    let mut bindings = Globals::new();
    let mut output = CollectPrint::new();
    let restored = script
        .restore(&blobs[0], &mut bindings, &context, &mut output)
        .unwrap();
    assert_eq!(restored.display_string(), "9");
    // work before the checkpoint does not run again
    assert_eq!(output.output(), "after");
}

#[test]
fn checkpoint_at_every_suspension_point_round_trips() {
    // several checkpoints in one run: each blob restores to the same value
    let source = "def total = 0\n\
                  def i = 1\n\
                  while (i <= 3) { checkpoint(); total = total + i; i = i + 1 }\n\
                  total";
    let (value, blobs, script, context) = run_with_checkpoints(source);
    assert_eq!(value.display_string(), "6");
    assert_eq!(blobs.len(), 3);
    for blob in &blobs {
        let mut bindings = Globals::new();
        let mut output = CollectPrint::new();
        let restored = script.restore(blob, &mut bindings, &context, &mut output).unwrap();
        assert!(value.loose_eq(&restored), "restored {restored}");
    }
}

#[test]
fn corrupt_checkpoint_is_rejected() {
    let (_, blobs, script, context) = run_with_checkpoints("checkpoint(); 1");
    let mut corrupted = blobs[0].clone();
    corrupted.truncate(corrupted.len() / 2);
    let mut bindings = Globals::new();
    let mut output = CollectPrint::new();
    let err = script.restore(&corrupted, &mut bindings, &context, &mut output);
    assert!(err.is_err());
}

// ============================================================================
// compiled-program round-trips
// ============================================================================

#[test]
fn script_dump_load_round_trips() {
    let mut context = Context::new();
    let script = Script::compile("switch (2) { 1 => 'a'; 2 => 'b'; default => 'c' }", "dump", &mut context)
        .unwrap();
    let bytes = script.dump().unwrap();
    let reloaded = Script::load(&bytes).unwrap();
    let mut bindings = Globals::new();
    let value = reloaded.run_sync(&mut bindings, &context).unwrap();
    assert_eq!(value.display_string(), "b");
}
