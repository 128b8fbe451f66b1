//! Integration tests for try/catch/finally and thread-level outcomes.

use std::cell::{Cell, RefCell};

use ctrlflow_runtime::thread::{self, EXIT_FAILURE, EXIT_SUCCESS};
use ctrlflow_runtime::{current_exception, rethrow, throw, try_catch, try_depth, Try};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Overheat {
    celsius: f32,
}

ctrlflow_runtime::throwable!(Overheat);

/// Catch fires, then finally fires.
#[test]
fn test_catch_then_finally() {
    let caught = Cell::new(None);
    let ran = Cell::new(false);

    try_catch! {
        { throw(5i32); }
        catch (i32, e) { caught.set(Some(e)); }
        finally { ran.set(true); }
    }

    assert_eq!(caught.get(), Some(5));
    assert!(ran.get());
}

/// With no throw only the body and finally run.
#[test]
fn test_no_throw_runs_body_and_finally() {
    let order = RefCell::new(Vec::new());

    try_catch! {
        { order.borrow_mut().push("try"); }
        catch (i32, _e) { order.borrow_mut().push("catch"); }
        finally { order.borrow_mut().push("finally"); }
    }

    assert_eq!(order.into_inner(), ["try", "finally"]);
}

#[test]
fn test_user_type_payload() {
    let caught = Cell::new(None);

    Try::new(|| throw(Overheat { celsius: 91.5 }))
        .catch(|_: f32| panic!("a float catch must not match a struct"))
        .catch(|e: Overheat| caught.set(Some(e)))
        .run();

    assert_eq!(caught.get(), Some(Overheat { celsius: 91.5 }));
}

#[test]
fn test_catch_any_sees_tag() {
    let tag = Cell::new("");

    Try::new(|| throw(Overheat { celsius: 0.0 }))
        .catch_any(|e| tag.set(e.type_name()))
        .run();

    assert_eq!(tag.get(), "Overheat");
}

#[test]
fn test_propagates_through_unmatched_scope() {
    let order = RefCell::new(Vec::new());

    Try::new(|| {
        Try::new(|| throw(3u8))
            .catch(|_: i32| order.borrow_mut().push("inner catch"))
            .finally(|| order.borrow_mut().push("inner finally"))
            .run();
        order.borrow_mut().push("unreachable");
    })
    .catch(|e: u8| order.borrow_mut().push(if e == 3 { "outer catch" } else { "wrong value" }))
    .run();

    assert_eq!(order.into_inner(), ["inner finally", "outer catch"]);
    assert_eq!(try_depth(), 0);
    assert!(current_exception().is_none());
}

#[test]
fn test_rethrow_reaches_outer_scope() {
    let order = RefCell::new(Vec::new());

    Try::new(|| {
        Try::new(|| throw(Overheat { celsius: 120.0 }))
            .catch(|_: Overheat| {
                order.borrow_mut().push("inner catch");
                rethrow();
            })
            .finally(|| order.borrow_mut().push("inner finally"))
            .run();
    })
    .catch(|e: Overheat| {
        assert_eq!(e.celsius, 120.0);
        order.borrow_mut().push("outer catch");
    })
    .run();

    assert_eq!(
        order.into_inner(),
        ["inner catch", "inner finally", "outer catch"]
    );
}

#[test]
fn test_exception_visible_while_in_flight() {
    Try::new(|| throw(9i64))
        .catch(|_: i64| {
            let current = current_exception().unwrap();
            assert_eq!(current.type_name(), "long");
            assert_eq!(current.downcast::<i64>(), Some(9));
        })
        .run();

    assert!(current_exception().is_none());
}

#[test]
fn test_unhandled_exception_ends_thread() {
    let handle = thread::spawn(|| {
        throw(1u16);
    })
    .unwrap();

    assert_eq!(handle.wait().unwrap(), EXIT_FAILURE);
}

#[test]
fn test_rethrow_without_exception_is_unexpected() {
    let handle = thread::spawn(|| {
        rethrow();
    })
    .unwrap();

    assert_eq!(handle.wait().unwrap(), EXIT_FAILURE);
}

fn overheat() {
    throw(Overheat { celsius: 300.0 })
}

#[test]
fn test_unhandled_exception_skips_rest_of_thread() {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = thread::spawn(move || {
        tx.send("before").unwrap();
        overheat();
        tx.send("after").unwrap();
        EXIT_SUCCESS
    })
    .unwrap();

    assert_eq!(handle.wait().unwrap(), EXIT_FAILURE);
    assert_eq!(rx.iter().collect::<Vec<_>>(), ["before"]);
}

#[test]
fn test_throw_inside_catch_is_unexpected() {
    let handle = thread::spawn(|| {
        Try::new(|| throw(1i32))
            .catch(|_: i32| throw(2i32))
            .run();
        EXIT_SUCCESS
    })
    .unwrap();

    assert_eq!(handle.wait().unwrap(), EXIT_FAILURE);
}

#[test]
fn test_throw_inside_finally_is_unexpected() {
    let handle = thread::spawn(|| {
        Try::new(|| {}).finally(|| throw(0.5f64)).run();
        EXIT_SUCCESS
    })
    .unwrap();

    assert_eq!(handle.wait().unwrap(), EXIT_FAILURE);
}

#[test]
fn test_handled_thread_succeeds() {
    let handle = thread::spawn(|| {
        let mut status = EXIT_FAILURE;
        Try::new(|| throw('x'))
            .catch(|c: char| {
                if c == 'x' {
                    status = EXIT_SUCCESS;
                }
            })
            .run();
        status
    })
    .unwrap();

    assert_eq!(handle.wait().unwrap(), EXIT_SUCCESS);
}
