//! Line commands read from stdin while joined to a room.

use halfway_mesh::{Location, LocationSource};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// `loc <lat> <lng> [address...]`
    AddLocation(Location),
    /// `rm <index>`
    RemoveLocation(usize),
    /// `name <new name>`
    Rename(String),
    /// `title <new title>`
    Title(String),
    /// `who`
    Who,
    /// `status`
    Status,
    /// `resume`
    Resume,
    /// `leave`
    Leave,
    Help,
}

pub const HELP: &str = "\
commands:
  loc <lat> <lng> [address]  add a location
  rm <index>                 remove a location
  name <name>                rename yourself
  title <title>              rename the room
  who                        list members and the midpoint
  status                     show link state
  resume                     reconnect now
  leave                      tell peers and exit";

pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word {
        "loc" => parse_location(rest).map(ConsoleCommand::AddLocation),
        "rm" => rest
            .parse()
            .map(ConsoleCommand::RemoveLocation)
            .map_err(|_| format!("not an index: {rest:?}")),
        "name" if !rest.is_empty() => Ok(ConsoleCommand::Rename(rest.to_string())),
        "title" if !rest.is_empty() => Ok(ConsoleCommand::Title(rest.to_string())),
        "name" | "title" => Err(format!("usage: {word} <text>")),
        "who" => Ok(ConsoleCommand::Who),
        "status" => Ok(ConsoleCommand::Status),
        "resume" => Ok(ConsoleCommand::Resume),
        "leave" | "quit" | "exit" => Ok(ConsoleCommand::Leave),
        "help" | "?" => Ok(ConsoleCommand::Help),
        other => Err(format!("unknown command {other:?}, try `help`")),
    }
}

fn parse_location(rest: &str) -> Result<Location, String> {
    let mut parts = rest.splitn(3, char::is_whitespace);
    let lat = parse_coordinate(parts.next(), "lat", 90.0)?;
    let lng = parse_coordinate(parts.next(), "lng", 180.0)?;
    let address = parts.next().map(str::trim).unwrap_or_default();
    let address = if address.is_empty() {
        format!("{lat:.5}, {lng:.5}")
    } else {
        address.to_string()
    };
    Ok(Location::new(lat, lng, address, LocationSource::Geocoded))
}

fn parse_coordinate(raw: Option<&str>, what: &str, limit: f64) -> Result<f64, String> {
    let raw = raw.filter(|s| !s.is_empty()).ok_or_else(|| format!("missing {what}"))?;
    let value: f64 = raw.parse().map_err(|_| format!("bad {what}: {raw:?}"))?;
    if !value.is_finite() || value.abs() > limit {
        return Err(format!("{what} out of range: {value}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location_with_address() {
        let cmd = parse("loc 48.85 2.35 Place de la Concorde").unwrap();
        let ConsoleCommand::AddLocation(loc) = cmd else {
            panic!("expected location");
        };
        assert_eq!(loc.lat, 48.85);
        assert_eq!(loc.lng, 2.35);
        assert_eq!(loc.address, "Place de la Concorde");
    }

    #[test]
    fn test_parse_location_without_address() {
        let ConsoleCommand::AddLocation(loc) = parse("loc 1 2").unwrap() else {
            panic!("expected location");
        };
        assert_eq!(loc.address, "1.00000, 2.00000");
    }

    #[test]
    fn test_parse_location_rejects_out_of_range() {
        assert!(parse("loc 91 0").is_err());
        assert!(parse("loc 0 abc").is_err());
        assert!(parse("loc").is_err());
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse("rm 2"), Ok(ConsoleCommand::RemoveLocation(2)));
        assert_eq!(parse("name  Ada Lovelace "), Ok(ConsoleCommand::Rename("Ada Lovelace".into())));
        assert_eq!(parse("title Friday dinner"), Ok(ConsoleCommand::Title("Friday dinner".into())));
        assert_eq!(parse("who"), Ok(ConsoleCommand::Who));
        assert_eq!(parse("quit"), Ok(ConsoleCommand::Leave));
        assert!(parse("name").is_err());
        assert!(parse("rm x").is_err());
        assert!(parse("dance").is_err());
    }
}
