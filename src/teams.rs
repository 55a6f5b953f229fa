//! Team resolver (C4): maps `IdP` group claims to the ordered set of teams a
//! user may act as.

use crate::config::TeamsConfig;
use crate::error::{BrokerError, Result};

/// Resolve `groups` into `candidate_teams`, failing with
/// [`BrokerError::NoTeamAssignment`] when the user belongs to zero
/// recognized teams.
pub fn resolve_candidate_teams(teams: &TeamsConfig, groups: &[String]) -> Result<Vec<String>> {
    let candidates = teams.candidate_teams(groups);
    if candidates.is_empty() {
        return Err(BrokerError::NoTeamAssignment);
    }
    Ok(candidates)
}

/// Validate that `team` is a member of `candidates`, as required when a
/// client explicitly selects a team via `/auth/select-team`.
pub fn validate_selection(candidates: &[String], team: &str) -> Result<()> {
    if candidates.iter().any(|c| c == team) {
        Ok(())
    } else {
        Err(BrokerError::InvalidTeamSelection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TeamDefinition;

    fn teams_with(group_to_team: &[(&str, &str)]) -> TeamsConfig {
        let mut teams = TeamsConfig::default();
        for (group, team) in group_to_team {
            teams.group_to_team.insert((*group).to_string(), (*team).to_string());
            teams.teams.entry((*team).to_string()).or_insert(TeamDefinition {
                jwt_role: None,
                token_role: format!("{team}-token"),
                ttl_default_secs: 3600,
                ttl_max_secs: 7200,
                uses: 10,
            });
        }
        teams
    }

    #[test]
    fn empty_groups_yield_no_team_assignment() {
        let teams = teams_with(&[("mobile-developers", "mobile-team")]);
        let result = resolve_candidate_teams(&teams, &[]);
        assert!(matches!(result, Err(BrokerError::NoTeamAssignment)));
    }

    #[test]
    fn unmapped_groups_yield_no_team_assignment() {
        let teams = teams_with(&[("mobile-developers", "mobile-team")]);
        let result = resolve_candidate_teams(&teams, &["unknown-group".to_string()]);
        assert!(matches!(result, Err(BrokerError::NoTeamAssignment)));
    }

    #[test]
    fn mapped_group_resolves_to_team() {
        let teams = teams_with(&[("mobile-developers", "mobile-team")]);
        let result = resolve_candidate_teams(&teams, &["mobile-developers".to_string()]).unwrap();
        assert_eq!(result, vec!["mobile-team"]);
    }

    #[test]
    fn selection_outside_candidates_is_rejected() {
        let candidates = vec!["mobile-team".to_string()];
        let result = validate_selection(&candidates, "backend-team");
        assert!(matches!(result, Err(BrokerError::InvalidTeamSelection)));
    }

    #[test]
    fn selection_within_candidates_is_accepted() {
        let candidates = vec!["mobile-team".to_string(), "backend-team".to_string()];
        assert!(validate_selection(&candidates, "backend-team").is_ok());
    }
}
