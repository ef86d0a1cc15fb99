//! Shared infrastructure for the opencan integration tests: a simulated CAN
//! bus and a scriptable mock node.
pub mod mock_node;
pub mod sim_bus;

/// Initialize logging for a test; safe to call from every test
pub fn init_test_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}
