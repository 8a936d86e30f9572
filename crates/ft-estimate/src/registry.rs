//! Process-scoped estimation state.
//!
//! The active flag and the set of kinds that could not be benchmarked are
//! shared by every thread. Device capabilities and loaded predictors are
//! reference counted and stay on the thread that activated the estimator.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use ft_core::OpKind;
use ft_device::{DeviceCapabilities, DeviceError};

use crate::error::EstimateError;
use crate::learned::{Predictor, PredictorGroup, PredictorStore};

static ACTIVE: AtomicBool = AtomicBool::new(false);
static UNSUPPORTED: Mutex<BTreeSet<OpKind>> = Mutex::new(BTreeSet::new());

type PredictorCache = BTreeMap<(PathBuf, PredictorGroup), Rc<Predictor>>;

thread_local! {
    static DEVICE: RefCell<Option<Rc<dyn DeviceCapabilities>>> = const { RefCell::new(None) };
    static PREDICTORS: RefCell<PredictorCache> = RefCell::new(BTreeMap::new());
}

/// Whether an estimator is currently active anywhere in the process.
#[must_use]
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

/// Mark an estimator active and install its device context on this thread.
pub(crate) fn acquire(capabilities: Rc<dyn DeviceCapabilities>) -> Result<(), EstimateError> {
    if ACTIVE
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(EstimateError::AlreadyActive);
    }
    DEVICE.with(|device| *device.borrow_mut() = Some(capabilities));
    Ok(())
}

pub(crate) fn release() {
    DEVICE.with(|device| device.borrow_mut().take());
    ACTIVE.store(false, Ordering::Release);
}

/// Device context of the active estimation. Fails when no device was
/// configured, before any query is made.
pub(crate) fn capabilities() -> Result<Rc<dyn DeviceCapabilities>, EstimateError> {
    DEVICE
        .with(|device| device.borrow().clone())
        .filter(|device| device.is_available())
        .ok_or(EstimateError::Device(DeviceError::Unavailable {
            query: "device capabilities",
        }))
}

pub(crate) fn record_unsupported(op: OpKind) {
    UNSUPPORTED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(op);
}

/// Operation kinds that could not be benchmarked, for the lifetime of the process.
#[must_use]
pub fn unsupported_fallbacks() -> Vec<OpKind> {
    UNSUPPORTED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .copied()
        .collect()
}

/// Load a predictor once and serve it from the cache afterwards.
pub(crate) fn cached_predictor(
    store: &PredictorStore,
    group: PredictorGroup,
) -> Result<Rc<Predictor>, EstimateError> {
    let key = (store.root().to_path_buf(), group);
    if let Some(predictor) = PREDICTORS.with(|cache| cache.borrow().get(&key).cloned()) {
        return Ok(predictor);
    }
    let predictor = Rc::new(store.load(group)?);
    PREDICTORS.with(|cache| cache.borrow_mut().insert(key, Rc::clone(&predictor)));
    Ok(predictor)
}

/// Drop cached predictors loaded from `root`.
pub fn evict_predictors(root: &Path) {
    PREDICTORS.with(|cache| cache.borrow_mut().retain(|(cached, _), _| cached != root));
}

/// Serializes unit tests that activate estimators.
#[cfg(test)]
pub(crate) fn exclusive() -> std::sync::MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use ft_core::OpKind;
    use ft_device::{DeviceProfile, UnavailableDevice};

    use super::{
        acquire, capabilities, exclusive, is_active, record_unsupported, release,
        unsupported_fallbacks,
    };
    use crate::error::EstimateError;

    #[test]
    fn only_one_activation_at_a_time() {
        let _serial = exclusive();
        acquire(Rc::new(DeviceProfile::a100())).expect("first");
        assert!(is_active());
        assert!(capabilities().is_ok());
        assert!(matches!(
            acquire(Rc::new(UnavailableDevice)),
            Err(EstimateError::AlreadyActive)
        ));
        release();
        assert!(!is_active());
        assert!(capabilities().is_err());
    }

    #[test]
    fn activation_is_visible_from_other_threads() {
        let _serial = exclusive();
        acquire(Rc::new(DeviceProfile::a100())).expect("first");
        let other = std::thread::spawn(|| {
            let seen = is_active();
            let second = acquire(Rc::new(DeviceProfile::h100()));
            (seen, matches!(second, Err(EstimateError::AlreadyActive)))
        })
        .join()
        .expect("join");
        release();
        assert_eq!(other, (true, true));
    }

    #[test]
    fn unconfigured_device_is_unavailable_while_active() {
        let _serial = exclusive();
        acquire(Rc::new(UnavailableDevice)).expect("acquire");
        let err = capabilities().err();
        release();
        assert!(matches!(err, Some(EstimateError::Device(_))));
    }

    #[test]
    fn unsupported_kinds_are_shared_across_threads() {
        std::thread::spawn(|| record_unsupported(OpKind::Baddbmm))
            .join()
            .expect("join");
        record_unsupported(OpKind::Baddbmm);
        let kinds = unsupported_fallbacks();
        assert_eq!(kinds.iter().filter(|kind| **kind == OpKind::Baddbmm).count(), 1);
    }
}
