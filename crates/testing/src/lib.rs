//! Multi-node test harness for `quorum`
//!
//! A [`TestDescription`](test_builder::TestDescription) names the network size, thresholds and
//! timing; [`gen_launcher`](test_builder::TestDescription::gen_launcher) turns it into a
//! [`TestLauncher`](test_launcher::TestLauncher) whose `launch` starts every node on the emulated
//! network and hands back a [`TestRunner`](test_runner::TestRunner).

#![cfg_attr(
    not(any(test, debug_assertions)),
    deprecated = "suspicious usage of testing/demo implementations in non-test/non-debug build"
)]

///  builder
pub mod test_builder;

/// launcher
pub mod test_launcher;

/// runner
pub mod test_runner;
