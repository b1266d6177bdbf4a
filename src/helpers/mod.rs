pub mod flag_guard;
pub mod line_buffer;
