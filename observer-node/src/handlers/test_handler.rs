//! Verdict parser for the `test` gametype, used for local and
//! integration testing without a real stream or EA title. Mirrors the
//! teacher's own `TestHandler`, which the original left as a stub that
//! only printed each line; here it actually interprets the line so the
//! supervisor's state machine can be driven end-to-end in tests without
//! a live subprocess talking to a real streaming service.

use observer_protocol::Winner;

use super::LineVerdict;

pub fn check(line: &str) -> LineVerdict {
    match line.trim() {
        "creator" => LineVerdict::Result(Winner::Creator),
        "opponent" => LineVerdict::Result(Winner::Opponent),
        "draw" => LineVerdict::Result(Winner::Draw),
        "offline" => LineVerdict::Offline,
        _ => LineVerdict::None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recognizes_each_verdict_line() {
        assert_eq!(check("creator"), LineVerdict::Result(Winner::Creator));
        assert_eq!(check("opponent"), LineVerdict::Result(Winner::Opponent));
        assert_eq!(check("draw"), LineVerdict::Result(Winner::Draw));
        assert_eq!(check("offline"), LineVerdict::Offline);
    }

    #[test]
    fn anything_else_is_noise() {
        assert_eq!(check("chatter"), LineVerdict::None);
        assert_eq!(check(""), LineVerdict::None);
    }
}
