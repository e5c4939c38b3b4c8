//! Integration-test-only crate; the end-to-end scenarios live in tests/.
