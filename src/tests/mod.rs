//! Cross-module tests exercising the reconciliation core end to end

mod events_test;
mod reload_test;
mod test_utils;
