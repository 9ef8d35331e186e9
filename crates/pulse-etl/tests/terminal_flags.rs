//! Conformance tests for the terminal-flag protocol across simulated
//! fan-outs: multi-repository runs with nested pagination, rate-limit
//! completion, and the boundary cases (zero items, single item, bulk
//! re-embed).

use serde_json::{json, Value};

use pulse_core::flags::nested_page_terminates;
use pulse_core::{ControlFlags, FanOut, NestedKind, RelayFlags};
use pulse_etl::extract::repohost::{
    filter_recent, has_nested_pagination, plan_nested_continuations,
};

fn pr_node(id: &str, updated: &str, commits_next: bool) -> Value {
    json!({
        "id": id,
        "updatedAt": updated,
        "commits": {
            "pageInfo": { "hasNextPage": commits_next, "endCursor": commits_next.then_some("c-100") }
        },
        "reviews": { "pageInfo": { "hasNextPage": false, "endCursor": null } },
        "comments": { "pageInfo": { "hasNextPage": false, "endCursor": null } },
        "reviewThreads": { "pageInfo": { "hasNextPage": false, "endCursor": null } },
    })
}

/// Walk one simulated job run over the repo-host pipeline and collect every
/// transform-stage flag set it would publish.
///
/// Scenario: `repo_count` repositories, the last repository has one PR whose
/// commit list spans `nested_pages` continuation pages.
fn simulate_repo_run(repo_count: usize, nested_pages: usize) -> Vec<ControlFlags> {
    let mut published = Vec::new();
    let seed = ControlFlags::seed();

    // Repository step: LOOP 1 fan-out to transform, job-terminal withheld.
    let step_flags = ControlFlags {
        last_job_item: false,
        rate_limited: false,
        ..seed
    };
    let loop1 = FanOut::new(step_flags, repo_count);
    for index in 0..repo_count {
        published.push(loop1.child(index));
    }

    // LOOP 2 seeds one PR extraction per repository; only the last carries
    // the relay bit.
    for repo_index in 0..repo_count {
        let relay = RelayFlags {
            last_parent: repo_index + 1 == repo_count,
            last_parent_last_nested: false,
        };
        let first_item = seed.first_item && repo_index == 0;

        // Each repository has one PR page. Only the last repository's PR
        // needs nested continuation pages.
        let has_nested = relay.last_parent && nested_pages > 0;
        let nodes = vec![pr_node("PR_last", "2025-06-01T00:00:00Z", has_nested)];
        let eligible = relay.last_parent && !has_nested_pagination(&nodes);
        let fan_out = FanOut::new(
            ControlFlags {
                first_item,
                last_item: true,
                last_job_item: true,
                rate_limited: false,
            },
            nodes.len(),
        )
        .terminal_eligible(eligible);
        for index in 0..nodes.len() {
            published.push(fan_out.child(index));
        }

        // Nested continuation chain for the last repository.
        if has_nested {
            let plan = plan_nested_continuations(&nodes, relay.last_parent, false);
            assert_eq!(plan.len(), 1);
            let relay = RelayFlags {
                last_parent: relay.last_parent,
                last_parent_last_nested: plan[0].last_parent_last_nested,
            };
            for page in 0..nested_pages {
                let has_next = page + 1 < nested_pages;
                let terminal = nested_page_terminates(relay, has_next);
                // Each continuation page fans out K commit rows downstream;
                // the transform message carries the page-level flags.
                published.push(ControlFlags {
                    first_item: false,
                    last_item: terminal,
                    last_job_item: terminal,
                    rate_limited: false,
                });
            }
        }
    }

    published
}

fn exactly_one_terminal(flags: &[ControlFlags]) {
    assert_eq!(
        flags.iter().filter(|f| f.last_job_item).count(),
        1,
        "exactly one message per run must carry last_job_item"
    );
    // first_item is step-scoped: at most one per step, never more than the
    // two steps of this pipeline.
    assert!(flags.iter().filter(|f| f.first_item).count() <= 2);
}

#[test]
fn multi_repo_run_without_nested_pages_terminates_on_the_last_pr() {
    let flags = simulate_repo_run(5, 0);
    exactly_one_terminal(&flags);
    // The terminal message is the very last one produced.
    assert!(flags.last().unwrap().last_job_item);
}

#[test]
fn nested_pagination_defers_the_terminal_to_the_final_commit_page() {
    // A PR with 350 commits: the first 100 arrive inline, then three
    // continuation pages.
    let flags = simulate_repo_run(5, 3);
    exactly_one_terminal(&flags);
    assert!(flags.last().unwrap().last_job_item);

    // No PR-level transform message may claim the terminal while nested
    // pages are still owed.
    let non_nested = &flags[..flags.len() - 3];
    assert!(non_nested.iter().all(|f| !f.last_job_item));
}

#[test]
fn single_repo_single_pr_collapses_the_flags() {
    let flags = simulate_repo_run(1, 0);
    exactly_one_terminal(&flags);
    let terminal = flags.last().unwrap();
    assert!(terminal.last_item && terminal.last_job_item);
}

#[test]
fn zero_children_fall_back_to_a_completion_message() {
    // Extraction found nothing: the seed's fan-out is empty and owes the
    // run its completion marker.
    let fan_out = FanOut::new(ControlFlags::seed(), 0);
    assert!(fan_out.completion_needed());

    let completion = ControlFlags::completion(false);
    assert!(!completion.first_item && completion.last_item && completion.last_job_item);
}

#[test]
fn rate_limit_completion_preserves_the_flag_through_transform_fanout() {
    // The transform stage forwards a rate-limited completion 1:1.
    let incoming = ControlFlags::completion(true);
    let forward = FanOut::new(incoming, 1).child(0);
    assert!(forward.last_item && forward.last_job_item && forward.rate_limited);
}

#[test]
fn stale_pages_are_cut_before_fanout() {
    let boundary = "2025-05-01T00:00:00Z".parse().unwrap();
    let nodes = vec![
        pr_node("fresh", "2025-06-01T00:00:00Z", false),
        pr_node("stale", "2025-04-01T00:00:00Z", false),
    ];
    let (kept, early) = filter_recent(nodes, Some(boundary));
    assert_eq!(kept.len(), 1);
    assert!(early);

    // Early termination suppresses the next-page follow-up, so the kept
    // page becomes terminal-eligible on the last-parent branch.
    let fan_out = FanOut::new(ControlFlags::seed(), kept.len()).terminal_eligible(true);
    assert!(fan_out.child(0).last_job_item);
}

#[test]
fn bulk_reembed_places_flags_on_first_and_kth_message() {
    let fan_out = FanOut::new(ControlFlags::seed(), 12);
    let flags: Vec<ControlFlags> = (0..12).map(|i| fan_out.child(i)).collect();
    assert!(flags[0].first_item);
    assert!(!flags[0].last_item);
    assert!(flags[11].last_item && flags[11].last_job_item);
    assert_eq!(flags.iter().filter(|f| f.last_job_item).count(), 1);
}

#[test]
fn nested_relay_is_held_by_exactly_one_branch() {
    let nodes = vec![
        pr_node("pr-1", "2025-06-03T00:00:00Z", true),
        pr_node("pr-2", "2025-06-02T00:00:00Z", true),
    ];
    let plan = plan_nested_continuations(&nodes, true, false);
    assert_eq!(plan.len(), 2);
    assert_eq!(
        plan.iter().filter(|c| c.last_parent_last_nested).count(),
        1
    );
    assert_eq!(plan.last().unwrap().kind, NestedKind::Commits);
    assert!(plan.last().unwrap().last_parent_last_nested);
}
