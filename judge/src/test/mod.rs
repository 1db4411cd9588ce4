//! Cross-component tests: the execution service over real localhost TCP, the
//! scheduler, and the judging pipeline end-to-end against a mock sandbox
//! backend.

mod util;
