// Toolpath tokenizer and opcode table
//
// A line is stripped of comments, split into words (letter + number), and
// dispatched on its first word through `OPCODES`. Each handler validates its
// own arguments and returns one `Command`.

use serde::Serialize;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GCodeError {
    #[error("unexpected character `{0}`")]
    InvalidCharacter(char),

    #[error("`{0}` has no numeric value")]
    MissingValue(char),

    #[error("`{letter}{text}` is not a number")]
    InvalidNumber { letter: char, text: String },

    #[error("unsupported command `{0}`")]
    Unsupported(String),

    #[error("`{opcode}` does not take `{letter}`")]
    UnexpectedArgument { opcode: String, letter: char },

    #[error("laser power {0} is outside 0-255")]
    PowerOutOfRange(f64),

    #[error("feed rate {0} is negative")]
    NegativeFeedRate(f64),

    #[error("program has no executable lines")]
    EmptyProgram,

    #[error("no program loaded")]
    NoProgram,

    #[error("program is running")]
    Busy,
}

pub type Result<T> = std::result::Result<T, GCodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositioningMode {
    #[default]
    Absolute,
    Relative,
}

/// One executable toolpath instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// G90 / G91
    SetMode(PositioningMode),
    /// G0 / G1; `feed` is in mm/min as written
    Move {
        rapid: bool,
        x: Option<f64>,
        y: Option<f64>,
        feed: Option<f64>,
        power: Option<u8>,
    },
    /// Bare F, mm/min
    FeedRate(f64),
    /// M3 with optional S
    LaserOn { power: Option<u8> },
    /// M5
    LaserOff,
    /// Bare S
    LaserPower(u8),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Word {
    letter: char,
    value: f64,
}

type Handler = fn(&str, &[Word]) -> Result<Command>;

/// Opcode table: first word of the line -> handler
const OPCODES: &[(&str, Handler)] = &[
    ("G0", parse_move),
    ("G1", parse_move),
    ("G90", parse_mode),
    ("G91", parse_mode),
    ("M3", parse_laser_on),
    ("M5", parse_laser_off),
];

/// Parse one line. Blank and comment-only lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Command>> {
    let words = tokenize(&strip_comments(line))?;
    let Some((first, args)) = words.split_first() else {
        return Ok(None);
    };

    match first.letter {
        'F' if args.is_empty() => feed_value(first.value).map(|f| Some(Command::FeedRate(f))),
        'S' if args.is_empty() => power_value(first.value).map(|p| Some(Command::LaserPower(p))),
        'G' | 'M' => {
            let opcode = opcode_key(first);
            let handler = OPCODES
                .iter()
                .find(|(key, _)| *key == opcode)
                .map(|(_, handler)| *handler)
                .ok_or_else(|| GCodeError::Unsupported(opcode.clone()))?;
            handler(&opcode, args).map(Some)
        }
        _ => Err(GCodeError::Unsupported(format!("{}{}", first.letter, first.value))),
    }
}

/// `G01` and `G1` share a key; fractional codes never match the table
fn opcode_key(word: &Word) -> String {
    if word.value.fract() == 0.0 && word.value >= 0.0 {
        format!("{}{}", word.letter, word.value as u32)
    } else {
        format!("{}{}", word.letter, word.value)
    }
}

/// Drop `;` comments and parenthesised text
fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

fn tokenize(line: &str) -> Result<Vec<Word>> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_whitespace() || c == '%' {
            continue;
        }
        if !c.is_ascii_alphabetic() {
            return Err(GCodeError::InvalidCharacter(c));
        }
        let letter = c.to_ascii_uppercase();

        while chars.peek().is_some_and(|c| *c == ' ' || *c == '\t') {
            chars.next();
        }
        let mut text = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() || d == '.' || d == '-' || d == '+' {
                text.push(d);
                chars.next();
            } else {
                break;
            }
        }
        if text.is_empty() {
            return Err(GCodeError::MissingValue(letter));
        }
        let value = text
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or(GCodeError::InvalidNumber { letter, text })?;
        words.push(Word { letter, value });
    }

    Ok(words)
}

fn power_value(v: f64) -> Result<u8> {
    if (0.0..=255.0).contains(&v) {
        Ok(v.round() as u8)
    } else {
        Err(GCodeError::PowerOutOfRange(v))
    }
}

fn feed_value(v: f64) -> Result<f64> {
    if v < 0.0 {
        Err(GCodeError::NegativeFeedRate(v))
    } else {
        Ok(v)
    }
}

fn unexpected(opcode: &str, letter: char) -> GCodeError {
    GCodeError::UnexpectedArgument {
        opcode: opcode.to_string(),
        letter,
    }
}

fn parse_move(opcode: &str, args: &[Word]) -> Result<Command> {
    let (mut x, mut y, mut feed, mut power) = (None, None, None, None);
    for word in args {
        match word.letter {
            'X' => x = Some(word.value),
            'Y' => y = Some(word.value),
            // planar robot: Z is accepted and ignored
            'Z' => {}
            'F' => feed = Some(feed_value(word.value)?),
            'S' => power = Some(power_value(word.value)?),
            other => return Err(unexpected(opcode, other)),
        }
    }
    Ok(Command::Move {
        rapid: opcode == "G0",
        x,
        y,
        feed,
        power,
    })
}

fn parse_mode(opcode: &str, args: &[Word]) -> Result<Command> {
    if let Some(word) = args.first() {
        return Err(unexpected(opcode, word.letter));
    }
    Ok(Command::SetMode(if opcode == "G90" {
        PositioningMode::Absolute
    } else {
        PositioningMode::Relative
    }))
}

fn parse_laser_on(opcode: &str, args: &[Word]) -> Result<Command> {
    let mut power = None;
    for word in args {
        match word.letter {
            'S' => power = Some(power_value(word.value)?),
            other => return Err(unexpected(opcode, other)),
        }
    }
    Ok(Command::LaserOn { power })
}

fn parse_laser_off(opcode: &str, args: &[Word]) -> Result<Command> {
    // `M5 S0` is common in generated files
    for word in args {
        if word.letter != 'S' {
            return Err(unexpected(opcode, word.letter));
        }
    }
    Ok(Command::LaserOff)
}

/// An executable line and where it came from (1-based)
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramLine {
    pub number: usize,
    pub command: Command,
}

/// A line that was dropped at load time
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedLine {
    pub number: usize,
    pub text: String,
    pub error: GCodeError,
}

/// A parsed toolpath
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    lines: Vec<ProgramLine>,
    skipped: Vec<SkippedLine>,
}

impl Program {
    /// Parse a whole program; bad lines are skipped with a warning
    pub fn parse(text: &str) -> Self {
        let mut program = Program::default();
        for (i, raw) in text.lines().enumerate() {
            let number = i + 1;
            match parse_line(raw) {
                Ok(Some(command)) => program.lines.push(ProgramLine { number, command }),
                Ok(None) => {}
                Err(error) => {
                    warn!("G-code line {} skipped ({}): {}", number, error, raw.trim());
                    program.skipped.push(SkippedLine {
                        number,
                        text: raw.trim().to_string(),
                        error,
                    });
                }
            }
        }
        program
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn lines(&self) -> &[ProgramLine] {
        &self.lines
    }

    pub fn skipped(&self) -> &[SkippedLine] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(x: Option<f64>, y: Option<f64>, feed: Option<f64>, power: Option<u8>) -> Command {
        Command::Move {
            rapid: false,
            x,
            y,
            feed,
            power,
        }
    }

    #[test]
    fn parses_supported_opcodes() {
        assert_eq!(
            parse_line("G90").unwrap(),
            Some(Command::SetMode(PositioningMode::Absolute))
        );
        assert_eq!(
            parse_line("g91").unwrap(),
            Some(Command::SetMode(PositioningMode::Relative))
        );
        assert_eq!(
            parse_line("G1 X10 Y-2.5 F600 S40").unwrap(),
            Some(mv(Some(10.0), Some(-2.5), Some(600.0), Some(40)))
        );
        assert_eq!(
            parse_line("G00 X1").unwrap(),
            Some(Command::Move {
                rapid: true,
                x: Some(1.0),
                y: None,
                feed: None,
                power: None,
            })
        );
        assert_eq!(parse_line("F1200").unwrap(), Some(Command::FeedRate(1200.0)));
        assert_eq!(
            parse_line("M3 S200").unwrap(),
            Some(Command::LaserOn { power: Some(200) })
        );
        assert_eq!(parse_line("M3").unwrap(), Some(Command::LaserOn { power: None }));
        assert_eq!(parse_line("M5").unwrap(), Some(Command::LaserOff));
        assert_eq!(parse_line("S0").unwrap(), Some(Command::LaserPower(0)));
    }

    #[test]
    fn words_need_no_spaces() {
        assert_eq!(
            parse_line("G1X5Y6").unwrap(),
            Some(mv(Some(5.0), Some(6.0), None, None))
        );
        assert_eq!(
            parse_line("G1 X 5").unwrap(),
            Some(mv(Some(5.0), None, None, None))
        );
    }

    #[test]
    fn comments_are_ignored() {
        assert_eq!(parse_line("; header").unwrap(), None);
        assert_eq!(parse_line("(setup) ").unwrap(), None);
        assert_eq!(
            parse_line("G1 X1 (go right) Y2 ; trailing").unwrap(),
            Some(mv(Some(1.0), Some(2.0), None, None))
        );
        assert_eq!(
            parse_line("G90 (use absolute coordinates)").unwrap(),
            Some(Command::SetMode(PositioningMode::Absolute))
        );
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("%").unwrap(), None);
    }

    #[test]
    fn rejects_bad_lines() {
        assert_eq!(
            parse_line("G2 X1 Y1 I5").unwrap_err(),
            GCodeError::Unsupported("G2".into())
        );
        assert_eq!(
            parse_line("G1.5 X1").unwrap_err(),
            GCodeError::Unsupported("G1.5".into())
        );
        assert_eq!(parse_line("G1 X").unwrap_err(), GCodeError::MissingValue('X'));
        assert!(matches!(
            parse_line("G1 X1-2").unwrap_err(),
            GCodeError::InvalidNumber { letter: 'X', .. }
        ));
        assert_eq!(
            parse_line("M3 S300").unwrap_err(),
            GCodeError::PowerOutOfRange(300.0)
        );
        assert_eq!(
            parse_line("G90 X1").unwrap_err(),
            GCodeError::UnexpectedArgument {
                opcode: "G90".into(),
                letter: 'X'
            }
        );
        assert_eq!(parse_line("G1 X1 #").unwrap_err(), GCodeError::InvalidCharacter('#'));
        assert_eq!(
            parse_line("T1").unwrap_err(),
            GCodeError::Unsupported("T1".into())
        );
    }

    #[test]
    fn program_skips_and_records_bad_lines() {
        let program = Program::parse("G90\n\n; comment\nG2 X1\nG1 X10 F60\nbogus\n");
        assert_eq!(program.len(), 2);
        assert_eq!(program.lines()[0].number, 1);
        assert_eq!(program.lines()[1].number, 5);

        let skipped: Vec<usize> = program.skipped().iter().map(|s| s.number).collect();
        assert_eq!(skipped, vec![4, 6]);
        assert_eq!(program.skipped()[0].text, "G2 X1");
    }
}
