#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Model(String),
    Who(String),
    Pair(String),
    Nick(String),
    History,
    Reset,
    Speedtest,
    Unknown(String),
}

/// Parses `/name[@bot] args`. Returns `None` for plain text and for commands
/// addressed to a different bot.
pub fn parse_command(text: &str, bot_username: &str) -> Option<Command> {
    let text = text.trim_start();
    let rest = text.strip_prefix('/')?;

    let (head, args) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim()),
        None => (rest, ""),
    };

    let name = match head.split_once('@') {
        Some((name, target)) => {
            if !target.eq_ignore_ascii_case(bot_username) {
                return None;
            }
            name
        }
        None => head,
    };
    if name.is_empty() {
        return None;
    }

    let args = args.to_string();
    let command = match name.to_lowercase().as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "model" => Command::Model(args),
        "who" => Command::Who(args),
        "pair" => Command::Pair(args),
        "nick" => Command::Nick(args),
        "history" => Command::History,
        "reset" | "new" => Command::Reset,
        "speedtest" => Command::Speedtest,
        other => Command::Unknown(other.to_string()),
    };
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arguments() {
        assert_eq!(
            parse_command("/who  будет дежурить ", "RelayBot"),
            Some(Command::Who("будет дежурить".to_string()))
        );
        assert_eq!(parse_command("/start", "RelayBot"), Some(Command::Start));
        assert_eq!(
            parse_command("/nick", "RelayBot"),
            Some(Command::Nick(String::new()))
        );
    }

    #[test]
    fn honours_bot_suffix() {
        assert_eq!(
            parse_command("/pair@relaybot я люблю", "RelayBot"),
            Some(Command::Pair("я люблю".to_string()))
        );
        assert_eq!(parse_command("/pair@OtherBot я люблю", "RelayBot"), None);
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("hello /start", "RelayBot"), None);
        assert_eq!(parse_command("/", "RelayBot"), None);
        assert_eq!(
            parse_command("/weather", "RelayBot"),
            Some(Command::Unknown("weather".to_string()))
        );
    }
}
