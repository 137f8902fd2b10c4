//! The two routines every single-shape stub is compiled against.
//!
//! They run on whatever thread invoked the hooked function, under the
//! Callback's shared lock for the duration of list iteration. Observers must
//! not mutate the same Callback's observer lists from inside a dispatch.

use crate::callback::Callback;
use crate::types::{CallbackType, Parameters, Property, Return, ReturnAction, ReturnFlag};

/// Pre-observer pass.
///
/// Combines observer actions by maximum, then folds the outcome into the
/// property flag: NoPost when no post-observer is registered, Supercede when
/// the combined action requests it.
pub unsafe extern "C" fn pre_dispatch(
    cb: *mut Callback,
    params: *const Parameters,
    prop: *mut Property,
    ret: *const Return,
) {
    let callback = &*cb;
    let mut action = ReturnAction::Ignored;

    {
        let snap = callback.snapshot(CallbackType::Pre);
        callback.cleanup();

        for &handler in snap.handlers() {
            let result = handler(cb, params, (*prop).count, ret, CallbackType::Pre);
            if result > action {
                action = result;
            }
        }
    }

    if !callback.any(CallbackType::Post) {
        (*prop).flag.insert(ReturnFlag::NOPOST);
    }
    if action >= ReturnAction::Supercede {
        (*prop).flag.insert(ReturnFlag::SUPERCEDE);
    }
}

/// Post-observer pass; observer return values are discarded.
pub unsafe extern "C" fn post_dispatch(
    cb: *mut Callback,
    params: *const Parameters,
    prop: *mut Property,
    ret: *const Return,
) {
    let callback = &*cb;
    let snap = callback.snapshot(CallbackType::Post);

    for &handler in snap.handlers() {
        handler(cb, params, (*prop).count, ret, CallbackType::Post);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use waylay_intercept::CodeArena;

    static PRE_HITS: AtomicU32 = AtomicU32::new(0);
    static POST_HITS: AtomicU32 = AtomicU32::new(0);

    unsafe extern "C" fn counting_pre(
        _cb: *mut Callback,
        _params: *const Parameters,
        _count: i32,
        _ret: *const Return,
        _ty: CallbackType,
    ) -> ReturnAction {
        PRE_HITS.fetch_add(1, Ordering::Relaxed);
        ReturnAction::Handled
    }

    unsafe extern "C" fn superceding(
        _cb: *mut Callback,
        _params: *const Parameters,
        _count: i32,
        _ret: *const Return,
        _ty: CallbackType,
    ) -> ReturnAction {
        ReturnAction::Supercede
    }

    unsafe extern "C" fn counting_post(
        _cb: *mut Callback,
        _params: *const Parameters,
        _count: i32,
        _ret: *const Return,
        _ty: CallbackType,
    ) -> ReturnAction {
        POST_HITS.fetch_add(1, Ordering::Relaxed);
        ReturnAction::Ignored
    }

    fn fresh() -> (Arc<CodeArena>, Box<Callback>) {
        let arena = Arc::new(CodeArena::new());
        let cb = Callback::new(Arc::downgrade(&arena));
        (arena, cb)
    }

    fn run_pre(cb: &Callback) -> Property {
        let params = [0u64; 2];
        let ret = 0u64;
        let mut prop = Property {
            count: 2,
            flag: ReturnFlag::DEFAULT,
        };
        unsafe {
            pre_dispatch(
                cb as *const Callback as *mut Callback,
                params.as_ptr() as *const Parameters,
                &mut prop,
                &ret as *const u64 as *const Return,
            );
        }
        prop
    }

    #[test]
    fn empty_post_list_sets_nopost() {
        let (_arena, cb) = fresh();
        cb.add(CallbackType::Pre, counting_pre);
        let prop = run_pre(&cb);
        assert!(prop.flag.contains(ReturnFlag::NOPOST));
        assert!(!prop.flag.contains(ReturnFlag::SUPERCEDE));
    }

    #[test]
    fn supercede_action_sets_the_flag() {
        let (_arena, cb) = fresh();
        cb.add(CallbackType::Pre, counting_pre);
        cb.add(CallbackType::Pre, superceding);
        cb.add(CallbackType::Post, counting_post);
        let prop = run_pre(&cb);
        assert!(prop.flag.contains(ReturnFlag::SUPERCEDE));
        assert!(!prop.flag.contains(ReturnFlag::NOPOST));
    }

    #[test]
    fn pre_runs_every_observer_in_order() {
        let (_arena, cb) = fresh();
        PRE_HITS.store(0, Ordering::Relaxed);
        cb.add(CallbackType::Pre, counting_pre);
        run_pre(&cb);
        assert_eq!(PRE_HITS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn post_discards_observer_returns() {
        let (_arena, cb) = fresh();
        POST_HITS.store(0, Ordering::Relaxed);
        cb.add(CallbackType::Post, counting_post);

        let params = [0u64; 1];
        let ret = 0u64;
        let mut prop = Property {
            count: 1,
            flag: ReturnFlag::DEFAULT,
        };
        unsafe {
            post_dispatch(
                &*cb as *const Callback as *mut Callback,
                params.as_ptr() as *const Parameters,
                &mut prop,
                &ret as *const u64 as *const Return,
            );
        }
        assert_eq!(POST_HITS.load(Ordering::Relaxed), 1);
        assert_eq!(prop.flag, ReturnFlag::DEFAULT);
    }
}
