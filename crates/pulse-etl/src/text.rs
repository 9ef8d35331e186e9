//! Canonical text projections.
//!
//! Each entity type projects into a deterministic text representation for
//! the vectorizer. Same row, same text, every time; re-embedding a row
//! overwrites its vector rather than drifting.

use pulse_postgres::SourceRow;

pub fn canonical_text(source: &SourceRow, changelog: &[String]) -> String {
    match source {
        SourceRow::Project {
            key,
            name,
            description,
        } => join_sections(&[
            &format!("project {key}: {name}"),
            description.as_deref().unwrap_or(""),
        ]),
        SourceRow::ProjectStatus { name, category } => match category {
            Some(category) => format!("status: {name} ({category})"),
            None => format!("status: {name}"),
        },
        SourceRow::WorkItem {
            key,
            title,
            body,
            item_type,
            status,
        } => {
            let mut sections = vec![
                format!("{key}: {title}"),
                body.clone().unwrap_or_default(),
                format!(
                    "type: {} | status: {}",
                    item_type.as_deref().unwrap_or("unknown"),
                    status.as_deref().unwrap_or("unknown"),
                ),
            ];
            if !changelog.is_empty() {
                sections.push(format!("changelog:\n{}", changelog.join("\n")));
            }
            let refs: Vec<&str> = sections.iter().map(String::as_str).collect();
            join_sections(&refs)
        }
        SourceRow::Repository {
            name,
            full_name,
            description,
        } => join_sections(&[
            &format!("repository {full_name} ({name})"),
            description.as_deref().unwrap_or(""),
        ]),
        SourceRow::PullRequest {
            number,
            title,
            body,
        } => join_sections(&[
            &format!("pull request #{number}: {title}"),
            body.as_deref().unwrap_or(""),
        ]),
        SourceRow::Commit { message, author } => match author {
            Some(author) => format!("commit by {author}:\n{message}"),
            None => format!("commit:\n{message}"),
        },
        SourceRow::Review { state, body } => join_sections(&[
            &format!("review ({})", state.as_deref().unwrap_or("COMMENTED")),
            body.as_deref().unwrap_or(""),
        ]),
        SourceRow::ReviewComment { body } => body.clone(),
        SourceRow::Link {
            work_item_external_id,
            repo_external_id,
            pr_number,
        } => format!(
            "work item {work_item_external_id} is linked to pull request #{pr_number} in repository {repo_external_id}"
        ),
        SourceRow::Mapping { label } => label.clone(),
    }
}

fn join_sections(sections: &[&str]) -> String {
    sections
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_projection_is_deterministic_and_complete() {
        let source = SourceRow::WorkItem {
            key: "CORE-7".into(),
            title: "Importer drops trailing comments".into(),
            body: Some("Steps to reproduce".into()),
            item_type: Some("Bug".into()),
            status: Some("In Progress".into()),
        };
        let changelog = vec!["status:  -> In Progress".to_string()];
        let first = canonical_text(&source, &changelog);
        let second = canonical_text(&source, &changelog);
        assert_eq!(first, second);
        assert!(first.starts_with("CORE-7: Importer drops trailing comments"));
        assert!(first.contains("type: Bug | status: In Progress"));
        assert!(first.contains("changelog:"));
    }

    #[test]
    fn empty_sections_are_elided() {
        let source = SourceRow::PullRequest {
            number: 42,
            title: "Stream large uploads".into(),
            body: None,
        };
        assert_eq!(canonical_text(&source, &[]), "pull request #42: Stream large uploads");
    }

    #[test]
    fn link_projection_names_all_three_keys() {
        let source = SourceRow::Link {
            work_item_external_id: "10042".into(),
            repo_external_id: "R_1".into(),
            pr_number: 41,
        };
        let text = canonical_text(&source, &[]);
        assert!(text.contains("10042"));
        assert!(text.contains("#41"));
        assert!(text.contains("R_1"));
    }
}
