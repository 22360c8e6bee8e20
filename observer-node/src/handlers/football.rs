//! Verdict parser for the EA football title family (the observer's
//! reference gametype). Ported line-for-line in behavior from the
//! original `FifaHandler.check`, including its defaulting/inference
//! fallbacks when a nickname doesn't match either stored player.

use observer_protocol::Winner;

use super::LineVerdict;
use crate::store::Stream;

/// Parses one line of watcher stdout into a verdict, offline marker, or
/// noise. See the module-level verdict-mapping rule this mirrors:
/// 1. identify which parsed nickname is the stored creator/opponent,
/// 2. if neither matches, default to side 1 = creator (and log it),
/// 3. if only one side matches, infer the other as the opposite,
/// 4. the higher score wins, mapped back through (1/2) to creator/opponent.
pub fn check(line: &str, stream: &Stream) -> LineVerdict {
    if line.contains("Stream is offline") {
        return LineVerdict::Offline;
    }
    if line.contains("Impossible to recognize who won") {
        tracing::warn!("couldn't get result, skipping");
        return LineVerdict::None;
    }
    if !line.contains("Score:") {
        return LineVerdict::None;
    }

    let Some((nick1, nick2)) = parse_players(line) else {
        return LineVerdict::None;
    };
    let Some((score1, score2)) = parse_score(line) else {
        return LineVerdict::None;
    };

    tracing::info!(nick1, nick2, score1, score2, "got score data");

    if score1 == score2 {
        tracing::info!("draw detected");
        return LineVerdict::Result(Winner::Draw);
    }

    let cl = stream.creator_lower();
    let ol = stream.opponent_lower();

    // side 1 or 2, whichever nickname matches.
    let mut creator_side: Option<u8> = None;
    let mut opponent_side: Option<u8> = None;
    if cl == nick1 {
        creator_side = Some(1);
    } else if cl == nick2 {
        creator_side = Some(2);
    }
    if ol == nick1 {
        opponent_side = Some(1);
    } else if ol == nick2 {
        opponent_side = Some(2);
    }

    if creator_side.is_none() && opponent_side.is_none() {
        tracing::warn!(line, "defaulting to creator! nickname matched neither side");
        creator_side = Some(1);
        opponent_side = Some(2);
    } else if creator_side.is_none() {
        creator_side = Some(if opponent_side == Some(2) { 1 } else { 2 });
    }

    let winning_side = if score1 > score2 { 1 } else { 2 };
    let winner = if Some(winning_side) == creator_side {
        Winner::Creator
    } else {
        Winner::Opponent
    };
    LineVerdict::Result(winner)
}

/// Extracts the two tab-separated nicknames from the `Players:` section,
/// normalized to lower case.
fn parse_players(line: &str) -> Option<(String, String)> {
    let after_players = line.split("Players:").nth(1)?;
    let (nick1, nick2) = after_players.trim().split_once("\t\t")?;
    Some((nick1.trim().to_lowercase(), nick2.trim().to_lowercase()))
}

/// Extracts the `a-b` score token (the one starting with a digit) from the
/// `Score:` section, which sits between `Score:` and `Players:`.
fn parse_score(line: &str) -> Option<(i64, i64)> {
    let after_score = line.split("Score:").nth(1)?;
    let before_players = after_score.split("Players:").next()?;
    let token = before_players
        .split_whitespace()
        .find(|tok| tok.contains('-') && tok.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    let (a, b) = token.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

#[cfg(test)]
mod test {
    use super::*;
    use observer_protocol::StreamState;

    fn stream(creator: &str, opponent: &str) -> Stream {
        Stream {
            handle: "h".into(),
            gametype: "fifa14-xboxone".into(),
            game_id: 1,
            supplementary_games: vec![],
            state: StreamState::Watching,
            creator: creator.into(),
            opponent: opponent.into(),
            child: None,
        }
    }

    fn score_line(nick1: &str, nick2: &str, score: &str) -> String {
        format!("Score: {score} Players: {nick1}\t\t{nick2}")
    }

    #[test]
    fn offline_is_detected() {
        let s = stream("a", "b");
        assert_eq!(check("Stream is offline, retrying", &s), LineVerdict::Offline);
    }

    #[test]
    fn unrecognized_result_is_noise() {
        let s = stream("a", "b");
        assert_eq!(
            check("Impossible to recognize who won this one", &s),
            LineVerdict::None
        );
    }

    #[test]
    fn equal_score_is_a_draw() {
        let s = stream("alice", "bob");
        let line = score_line("alice", "bob", "2-2");
        assert_eq!(check(&line, &s), LineVerdict::Result(Winner::Draw));
    }

    #[test]
    fn creator_wins_when_nick_matches_and_has_higher_score() {
        let s = stream("alice", "bob");
        let line = score_line("alice", "bob", "3-1");
        assert_eq!(check(&line, &s), LineVerdict::Result(Winner::Creator));
    }

    #[test]
    fn opponent_wins_when_sides_are_swapped_in_the_line() {
        let s = stream("alice", "bob");
        let line = score_line("bob", "alice", "3-1");
        // bob (opponent) is side 1 and has the higher score.
        assert_eq!(check(&line, &s), LineVerdict::Result(Winner::Opponent));
    }

    #[test]
    fn case_insensitive_nickname_match() {
        let s = stream("Alice", "BOB");
        let line = score_line("alice", "bob", "0-1");
        assert_eq!(check(&line, &s), LineVerdict::Result(Winner::Opponent));
    }

    #[test]
    fn neither_nickname_matches_defaults_to_side_one_as_creator() {
        let s = stream("zack", "yara");
        let line = score_line("alice", "bob", "3-1");
        // side 1 (alice) wins and is defaulted to creator.
        assert_eq!(check(&line, &s), LineVerdict::Result(Winner::Creator));
    }

    #[test]
    fn only_creator_matches_opponent_is_inferred_as_other_side() {
        let s = stream("alice", "nonexistent");
        let line = score_line("alice", "bob", "1-3");
        // alice (creator) is side 1, so side 2 (bob) is inferred opponent and wins.
        assert_eq!(check(&line, &s), LineVerdict::Result(Winner::Opponent));
    }

    #[test]
    fn non_score_line_is_noise() {
        let s = stream("alice", "bob");
        assert_eq!(check("just some chatter", &s), LineVerdict::None);
    }
}
