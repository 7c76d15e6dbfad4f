// Toolpath support for the laser robot
//
// Provides:
// - Tokenizer and table-driven parser for the G-code dialect
// - The cooperative executor that turns lines into timed velocity segments

mod interpreter;
pub mod parser;

pub use interpreter::{GCodeState, Interpreter, ProgramProgress, RunState, Segment, StopReason};
pub use parser::{Command, GCodeError, PositioningMode, Program, parse_line};
