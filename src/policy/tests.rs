use std::collections::BTreeSet;

use super::*;

fn tools(names: &[&str]) -> BTreeSet<ToolId> {
    names.iter().map(|name| ToolId::from(*name)).collect()
}

fn think_first() -> Requirement {
    Requirement::new("think")
        .force_at_step(1)
        .min_invocations(1)
        .max_invocations(5)
        .consecutive_allowed(false)
}

fn engine(requirements: Vec<Requirement>) -> PolicyEngine {
    PolicyEngine::new(RequirementSet::new(requirements).expect("valid requirements"))
}

#[test]
fn forced_first_step_blocks_termination() {
    let engine = engine(vec![think_first()]);

    let decision = engine
        .evaluate(&Transcript::new(), FIRST_STEP)
        .expect("evaluates");

    assert_eq!(decision.forced, tools(&["think"]));
    assert_eq!(decision.allowed, decision.forced);
    assert!(!decision.termination_allowed);
}

#[test]
fn max_invocations_excludes_tool_and_termination_follows_min() {
    let transcript = Transcript::from_tools(["think", "think"]);

    let capped = engine(vec![Requirement::new("think").max_invocations(2)]);
    let decision = capped.evaluate(&transcript, 3).expect("evaluates");
    assert!(!decision.permits("think"));
    assert!(decision.forced.is_empty());
    assert!(decision.termination_allowed);

    let with_min = engine(vec![
        Requirement::new("think").min_invocations(3).max_invocations(3),
    ]);
    let decision = with_min.evaluate(&transcript, 3).expect("evaluates");
    assert!(decision.permits("think"));
    assert!(!decision.termination_allowed);
    assert_eq!(decision.unsatisfied, tools(&["think"]));
}

#[test]
fn only_after_opens_once_gate_tool_ran() {
    let engine = engine(vec![Requirement::new("wikipedia").only_after(["think"])]);

    let before = engine.evaluate(&Transcript::new(), 1).expect("evaluates");
    assert!(!before.permits("wikipedia"));
    assert!(before.permits("think"));

    let transcript = Transcript::from_tools(["think"]);
    let after = engine
        .evaluate(&transcript, transcript.next_step())
        .expect("evaluates");
    assert!(after.permits("wikipedia"));
}

#[test]
fn duplicate_forced_step_is_rejected_at_construction() {
    let err = RequirementSet::new(vec![
        Requirement::new("think").force_at_step(1),
        Requirement::new("wikipedia").force_at_step(1),
    ])
    .expect_err("must conflict");

    assert!(err.is_configuration_conflict());
    assert!(matches!(err, PolicyError::DuplicateForcedStep { step: 1, .. }));
}

#[test]
fn inverted_bounds_are_rejected() {
    let err = RequirementSet::new(vec![
        Requirement::new("think").min_invocations(4).max_invocations(2),
    ])
    .expect_err("must conflict");

    assert_eq!(
        err,
        PolicyError::InvalidBounds {
            tool: ToolId::from("think"),
            min: 4,
            max: 2,
        }
    );
}

#[test]
fn self_gate_and_capped_force_are_rejected() {
    let self_gated = RequirementSet::new(vec![Requirement::new("think").only_after(["think"])]);
    assert!(matches!(self_gated, Err(PolicyError::SelfGated { .. })));

    let capped = RequirementSet::new(vec![
        Requirement::new("think").force_at_step(2).max_invocations(0),
    ]);
    assert!(matches!(
        capped,
        Err(PolicyError::ForcedButCapped { step: 2, .. })
    ));
}

#[test]
fn non_consecutive_tool_is_excluded_after_itself() {
    let engine = engine(vec![think_first()]).with_tools(["wikipedia"]);
    let transcript = Transcript::from_tools(["think"]);

    let decision = engine.evaluate(&transcript, 2).expect("evaluates");

    assert!(!decision.permits("think"));
    assert!(decision.permits("wikipedia"));
    assert!(decision.termination_allowed);
}

#[test]
fn force_after_makes_follow_up_mandatory() {
    let engine = engine(vec![
        Requirement::new("summarize").force_after(["search"]),
    ])
    .with_tools(["search", "think"]);

    let transcript = Transcript::from_tools(["search"]);
    let decision = engine.evaluate(&transcript, 2).expect("evaluates");
    assert_eq!(decision.forced, tools(&["summarize"]));
    assert_eq!(decision.allowed, tools(&["summarize"]));
    assert!(!decision.termination_allowed);

    let transcript = Transcript::from_tools(["search", "summarize"]);
    let decision = engine.evaluate(&transcript, 3).expect("evaluates");
    assert!(decision.forced.is_empty());
    assert_eq!(decision.allowed, tools(&["search", "summarize", "think"]));
}

#[test]
fn forcing_yields_to_exhausted_bounds() {
    let engine = engine(vec![
        Requirement::new("summarize")
            .force_after(["search"])
            .max_invocations(1),
    ]);

    let transcript = Transcript::from_tools(["search", "summarize", "search"]);
    let decision = engine.evaluate(&transcript, 4).expect("evaluates");

    assert!(decision.forced.is_empty());
    assert!(!decision.permits("summarize"));
    assert!(decision.permits("search"));
}

#[test]
fn forced_tool_behind_closed_gate_is_a_conflict() {
    let engine = engine(vec![
        Requirement::new("wikipedia")
            .force_at_step(2)
            .only_after(["think"]),
    ])
    .with_tools(["search"]);

    let transcript = Transcript::from_tools(["search"]);
    let err = engine.evaluate(&transcript, 2).expect_err("must conflict");
    assert_eq!(
        err,
        PolicyError::ForcedButGated {
            tool: ToolId::from("wikipedia"),
            step: 2,
        }
    );
}

#[test]
fn gated_tool_forced_at_first_step_is_rejected_at_construction() {
    let err = RequirementSet::new(vec![
        Requirement::new("wikipedia").force_at_step(FIRST_STEP),
        Requirement::new("wikipedia").only_after(["think"]),
    ])
    .expect_err("must conflict");

    assert_eq!(
        err,
        PolicyError::ForcedButGated {
            tool: ToolId::from("wikipedia"),
            step: FIRST_STEP,
        }
    );
}

#[test]
fn bounds_split_across_requirements_are_merged() {
    let err = RequirementSet::new(vec![
        Requirement::new("think").min_invocations(3),
        Requirement::new("think").max_invocations(1),
    ])
    .expect_err("must conflict");
    assert_eq!(
        err,
        PolicyError::InvalidBounds {
            tool: ToolId::from("think"),
            min: 3,
            max: 1,
        }
    );

    let set = RequirementSet::new(vec![
        Requirement::new("think").min_invocations(1).max_invocations(4),
        Requirement::new("think").min_invocations(2).max_invocations(2),
    ])
    .expect("tightest bounds still fit");
    let decision = PolicyEngine::new(set)
        .evaluate(&Transcript::from_tools(["think", "think"]), 3)
        .expect("evaluates");
    assert!(!decision.permits("think"));
    assert!(decision.termination_allowed);
}

#[test]
fn force_split_from_zero_cap_is_rejected() {
    let err = RequirementSet::new(vec![
        Requirement::new("think").force_at_step(1),
        Requirement::new("think").max_invocations(0),
    ])
    .expect_err("must conflict");

    assert_eq!(
        err,
        PolicyError::ForcedButCapped {
            tool: ToolId::from("think"),
            step: 1,
        }
    );
}

#[test]
fn same_tool_forced_twice_at_one_step_is_not_a_duplicate() {
    let engine = engine(vec![
        Requirement::new("think").force_at_step(1),
        Requirement::new("think").force_at_step(1).min_invocations(1),
    ]);

    let decision = engine.evaluate(&Transcript::new(), 1).expect("evaluates");
    assert_eq!(decision.forced, tools(&["think"]));
}

#[test]
fn two_tools_forced_after_same_step_is_a_conflict() {
    let engine = engine(vec![
        Requirement::new("summarize").force_after(["search"]),
        Requirement::new("cite").force_after(["search"]),
    ]);

    let transcript = Transcript::from_tools(["search"]);
    let err = engine.evaluate(&transcript, 2).expect_err("must conflict");

    assert!(matches!(
        err,
        PolicyError::AmbiguousForceAfter { step: 2, ref tools } if tools.len() == 2
    ));
}

#[test]
fn unknown_tools_in_transcript_are_accepted() {
    let engine = engine(vec![Requirement::new("think").max_invocations(1)]);
    let transcript = Transcript::from_tools(["calculator", "think"]);

    let decision = engine.evaluate(&transcript, 3).expect("evaluates");

    assert!(decision.allowed.is_empty());
    assert!(decision.termination_allowed);
    assert!(!decision.is_exhausted());
}

#[test]
fn evaluation_only_sees_records_before_the_step() {
    let engine = engine(vec![think_first()]);
    let transcript = Transcript::from_tools(["think", "wikipedia"]);

    let replay = engine.evaluate(&transcript, 1).expect("evaluates");
    assert_eq!(replay.forced, tools(&["think"]));
}

#[test]
fn evaluation_is_deterministic() {
    let engine = engine(vec![
        think_first(),
        Requirement::new("wikipedia")
            .only_after(["think"])
            .min_invocations(1)
            .max_invocations(4)
            .consecutive_allowed(false),
    ]);
    let transcript = Transcript::from_tools(["think", "wikipedia", "think"]);

    let first = engine.evaluate(&transcript, 4).expect("evaluates");
    let second = engine.evaluate(&transcript, 4).expect("evaluates");
    assert_eq!(first, second);
    assert_eq!(
        first,
        evaluate(&transcript, engine.requirements(), 4).expect("evaluates")
    );
}

#[test]
fn denied_tools_leave_an_exhausted_decision() {
    let engine = engine(vec![Requirement::new("think").min_invocations(1)]);
    let mut decision = engine.evaluate(&Transcript::new(), 1).expect("evaluates");
    assert!(!decision.is_exhausted());

    decision.deny("think");
    assert!(decision.is_exhausted());
}

#[test]
fn transcript_rejects_out_of_order_steps() {
    let err = Transcript::from_records([
        InvocationRecord {
            tool: "think".into(),
            step_index: 2,
        },
        InvocationRecord {
            tool: "wikipedia".into(),
            step_index: 2,
        },
    ])
    .expect_err("must reject");

    assert!(!err.is_configuration_conflict());
    assert_eq!(
        err,
        PolicyError::TranscriptOutOfOrder {
            previous: 2,
            step: 2
        }
    );
}

#[test]
fn transcript_append_assigns_consecutive_steps() {
    let mut transcript = Transcript::new();
    assert_eq!(transcript.next_step(), FIRST_STEP);

    assert_eq!(transcript.append("think").expect("in range").step_index, 1);
    assert_eq!(transcript.append("wikipedia").expect("in range").step_index, 2);
    assert_eq!(transcript.count("think"), 1);
    assert_eq!(transcript.before(2).len(), 1);
}

#[test]
fn transcript_rejects_step_without_successor() {
    let err = Transcript::from_records([InvocationRecord {
        tool: "think".into(),
        step_index: u32::MAX,
    }])
    .expect_err("must reject");
    assert_eq!(err, PolicyError::StepOutOfRange { step: u32::MAX });
    assert!(!err.is_configuration_conflict());

    let mut transcript = Transcript::from_records([InvocationRecord {
        tool: "think".into(),
        step_index: u32::MAX - 1,
    }])
    .expect("last usable step");
    assert_eq!(transcript.next_step(), u32::MAX);
    assert!(transcript.append("think").is_err());
    assert_eq!(transcript.len(), 1);
}
