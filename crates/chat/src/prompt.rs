use immix_wire::ChatTurn;

/// Role-tagged transcript handed to the generator: one `role: content` entry
/// per turn, in the order given.
pub fn build_transcript(turns: &[ChatTurn]) -> String {
    turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use immix_wire::Role;

    use super::*;

    #[test]
    fn tags_every_turn_in_order() {
        let turns = vec![
            ChatTurn::new(Role::System, "be brief"),
            ChatTurn::new(Role::User, "Hello"),
            ChatTurn::new(Role::Assistant, "Hi"),
            ChatTurn::new(Role::User, "Again"),
        ];
        assert_eq!(
            build_transcript(&turns),
            "system: be brief\nuser: Hello\nassistant: Hi\nuser: Again"
        );
        assert_eq!(build_transcript(&[]), "");
    }
}
