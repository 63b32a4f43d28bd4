mod eh;
mod fake_stack;
mod gc;
mod registry;
