//! REPL command parsing

use tandem_core::{Selection, Step};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Show,
    Status,
    Authors,
    Insert { pos: usize, text: String },
    Append(String),
    Delete { pos: usize, len: usize },
    Select(Selection),
    Name(String),
    Color(String),
    Help,
    Clear,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim_start()),
            None => (line, ""),
        };

        match word.to_lowercase().as_str() {
            "show" | "text" => Ok(Command::Show),
            "status" => Ok(Command::Status),
            "authors" | "who" => Ok(Command::Authors),
            "insert" | "ins" => {
                let (pos, text) = rest
                    .split_once(' ')
                    .ok_or("usage: insert <pos> <text>")?;
                Ok(Command::Insert {
                    pos: parse_offset(pos)?,
                    text: text.to_string(),
                })
            }
            "append" | "add" if !rest.is_empty() => Ok(Command::Append(rest.to_string())),
            "delete" | "del" => {
                let mut args = rest.split_whitespace();
                match (args.next(), args.next(), args.next()) {
                    (Some(pos), Some(len), None) => Ok(Command::Delete {
                        pos: parse_offset(pos)?,
                        len: parse_offset(len)?,
                    }),
                    _ => Err("usage: delete <pos> <len>".into()),
                }
            }
            "select" | "sel" => {
                let mut args = rest.split_whitespace();
                match (args.next(), args.next(), args.next()) {
                    (Some(pos), None, None) => Ok(Command::Select(Selection::caret(parse_offset(pos)?))),
                    (Some(anchor), Some(head), None) => Ok(Command::Select(Selection::new(
                        parse_offset(anchor)?,
                        parse_offset(head)?,
                    ))),
                    _ => Err("usage: select <anchor> [head]".into()),
                }
            }
            "name" if !rest.is_empty() => Ok(Command::Name(rest.to_string())),
            "color" if is_hex_color(rest) => Ok(Command::Color(rest.to_string())),
            "color" => Err("usage: color <#rrggbb>".into()),
            "help" | "?" => Ok(Command::Help),
            "clear" => Ok(Command::Clear),
            "quit" | "exit" => Ok(Command::Quit),
            "append" | "add" => Err("usage: append <text>".into()),
            "name" => Err("usage: name <display name>".into()),
            other => Err(format!("unknown command '{}', type 'help'", other)),
        }
    }
}

fn parse_offset(arg: &str) -> Result<usize, String> {
    arg.parse().map_err(|_| format!("'{}' is not a position", arg))
}

fn is_hex_color(arg: &str) -> bool {
    arg.len() == 7 && arg.starts_with('#') && arg[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Delete step for `len` characters at `pos` of `text`
pub fn delete_step(text: &str, pos: usize, len: usize) -> Result<Step, String> {
    let total = text.chars().count();
    if pos + len > total {
        return Err(format!("range {}..{} is past the end ({})", pos, pos + len, total));
    }
    let removed: String = text.chars().skip(pos).take(len).collect();
    Ok(Step::delete(pos, removed))
}
