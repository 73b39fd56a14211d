// Test module organization
mod helpers;

mod test_api;
mod test_calls;
mod test_coroutine;
mod test_stack;
mod test_table;
mod test_vm;
