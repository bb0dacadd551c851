//! Ambient mesh context.
//!
//! A mesh installed with [`with_mesh`] is visible to every shard map created without an
//! explicit mesh and called on the same thread while the closure runs. Contexts nest;
//! the innermost one wins.

use core::cell::RefCell;

use super::DeviceMesh;

std::thread_local! {
    static MESH_STACK: RefCell<Vec<DeviceMesh>> = const { RefCell::new(Vec::new()) };
}

struct MeshGuard;

impl Drop for MeshGuard {
    fn drop(&mut self) {
        MESH_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Runs `f` with `mesh` as the ambient mesh of the current thread.
pub fn with_mesh<R>(mesh: DeviceMesh, f: impl FnOnce() -> R) -> R {
    MESH_STACK.with(|stack| stack.borrow_mut().push(mesh));
    let _guard = MeshGuard;
    f()
}

/// The innermost ambient mesh of the current thread, if any.
pub fn current_mesh() -> Option<DeviceMesh> {
    MESH_STACK.with(|stack| stack.borrow().last().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_nest_and_unwind() {
        let outer = DeviceMesh::make([2], ["batch"]).unwrap();
        let inner = DeviceMesh::make([4], ["batch"]).unwrap();

        assert_eq!(current_mesh(), None);
        with_mesh(outer.clone(), || {
            assert_eq!(current_mesh(), Some(outer.clone()));
            with_mesh(inner.clone(), || {
                assert_eq!(current_mesh(), Some(inner.clone()));
            });
            assert_eq!(current_mesh(), Some(outer.clone()));
        });
        assert_eq!(current_mesh(), None);
    }

    #[test]
    fn context_is_popped_on_panic() {
        let mesh = DeviceMesh::make([2], ["batch"]).unwrap();

        let result = std::panic::catch_unwind(|| with_mesh::<()>(mesh, || panic!("boom")));

        assert!(result.is_err());
        assert_eq!(current_mesh(), None);
    }
}
