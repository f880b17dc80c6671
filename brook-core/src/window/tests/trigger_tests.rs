use super::*;
use crate::error::EngineError;

fn elements(trigger: &Trigger, state: &mut TriggerState, n: usize) -> Vec<TriggerResult> {
    (0..n)
        .map(|_| trigger.evaluate(state, TriggerEvent::elements(1, false)))
        .collect()
}

fn fires(results: &[TriggerResult]) -> usize {
    results.iter().filter(|r| r.is_fire()).count()
}

// ── Leaf triggers ─────────────────────────────────────────────────────────

#[test]
fn test_element_count_fires_once_after_nth_element() {
    let t = Trigger::ElementCount(3);
    let mut st = t.new_state();
    let results = elements(&t, &mut st, 5);
    assert_eq!(
        results,
        vec![
            TriggerResult::None,
            TriggerResult::None,
            TriggerResult::FireAndFinish,
            TriggerResult::None,
            TriggerResult::None,
        ]
    );
    assert!(st.is_finished());
}

#[test]
fn test_element_count_counts_batched_elements() {
    let t = Trigger::ElementCount(3);
    let mut st = t.new_state();
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::elements(4, false)),
        TriggerResult::FireAndFinish
    );
}

#[test]
fn test_always_and_never() {
    let always = Trigger::Always;
    let mut st = always.new_state();
    assert_eq!(fires(&elements(&always, &mut st, 3)), 3);
    assert!(!st.is_finished());

    let never = Trigger::Never;
    let mut st = never.new_state();
    assert_eq!(fires(&elements(&never, &mut st, 3)), 0);
    assert_eq!(
        never.evaluate(&mut st, TriggerEvent::watermark(true)),
        TriggerResult::None
    );
}

#[test]
fn test_default_fires_once_at_end_of_window() {
    let t = Trigger::Default;
    let mut st = t.new_state();
    assert_eq!(fires(&elements(&t, &mut st, 10)), 0);
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::watermark(true)),
        TriggerResult::FireAndFinish
    );
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::elements(1, true)),
        TriggerResult::None
    );
}

// ── AfterEndOfWindow ──────────────────────────────────────────────────────

#[test]
fn test_after_end_of_window_without_late_finishes_on_time() {
    let t = Trigger::AfterEndOfWindow {
        early: None,
        late: None,
    };
    let mut st = t.new_state();
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::elements(2, false)),
        TriggerResult::None
    );
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::watermark(true)),
        TriggerResult::FireAndFinish
    );
}

#[test]
fn test_after_end_of_window_late_firings() {
    let t = Trigger::AfterEndOfWindow {
        early: None,
        late: Some(Box::new(Trigger::ElementCount(1))),
    };
    let mut st = t.new_state();
    t.evaluate(&mut st, TriggerEvent::elements(1, false));
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::watermark(true)),
        TriggerResult::Fire
    );
    // nothing new: no late pane
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::watermark(true)),
        TriggerResult::None
    );
    // every late element re-arms the late trigger
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::elements(1, true)),
        TriggerResult::Fire
    );
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::elements(1, true)),
        TriggerResult::Fire
    );
}

#[test]
fn test_after_end_of_window_early_firings() {
    let t = Trigger::AfterEndOfWindow {
        early: Some(Box::new(Trigger::ElementCount(2))),
        late: None,
    };
    let mut st = t.new_state();
    let results = elements(&t, &mut st, 5);
    assert_eq!(fires(&results), 2);
    assert!(results.iter().all(|r| !r.is_finish()));
    // one buffered early element does not block the on-time firing
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::watermark(true)),
        TriggerResult::FireAndFinish
    );
}

// ── Composites ────────────────────────────────────────────────────────────

#[test]
fn test_after_all_waits_for_every_child() {
    let t = Trigger::AfterAll(vec![Trigger::ElementCount(2), Trigger::ElementCount(3)]);
    let mut st = t.new_state();
    let results = elements(&t, &mut st, 4);
    assert_eq!(
        results,
        vec![
            TriggerResult::None,
            TriggerResult::None,
            TriggerResult::FireAndFinish,
            TriggerResult::None,
        ]
    );
}

#[test]
fn test_after_any_fires_on_first_child() {
    let t = Trigger::AfterAny(vec![Trigger::ElementCount(5), Trigger::Default]);
    let mut st = t.new_state();
    assert_eq!(fires(&elements(&t, &mut st, 2)), 0);
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::watermark(true)),
        TriggerResult::FireAndFinish
    );
}

#[test]
fn test_after_each_hands_off_in_sequence() {
    let t = Trigger::AfterEach(vec![Trigger::ElementCount(1), Trigger::ElementCount(2)]);
    let mut st = t.new_state();
    let results = elements(&t, &mut st, 4);
    assert_eq!(
        results,
        vec![
            TriggerResult::Fire,
            TriggerResult::None,
            TriggerResult::FireAndFinish,
            TriggerResult::None,
        ]
    );
}

#[test]
fn test_repeatedly_rearms_child() {
    let t = Trigger::Repeatedly(Box::new(Trigger::ElementCount(2)));
    let mut st = t.new_state();
    let results = elements(&t, &mut st, 6);
    assert_eq!(fires(&results), 3);
    assert!(results.iter().all(|r| !r.is_finish()));
}

#[test]
fn test_or_finally_fires_per_element_until_end_of_window() {
    let t = Trigger::OrFinally {
        main: Box::new(Trigger::Repeatedly(Box::new(Trigger::ElementCount(1)))),
        finally: Box::new(Trigger::AfterEndOfWindow {
            early: None,
            late: None,
        }),
    };
    let mut st = t.new_state();
    let results = elements(&t, &mut st, 3);
    assert_eq!(results, vec![TriggerResult::Fire; 3]);
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::watermark(true)),
        TriggerResult::FireAndFinish
    );
    assert_eq!(
        t.evaluate(&mut st, TriggerEvent::elements(1, true)),
        TriggerResult::None
    );
}

#[test]
fn test_or_finally_closes_when_main_finishes() {
    let t = Trigger::OrFinally {
        main: Box::new(Trigger::ElementCount(2)),
        finally: Box::new(Trigger::Never),
    };
    let mut st = t.new_state();
    assert_eq!(
        elements(&t, &mut st, 2),
        vec![TriggerResult::None, TriggerResult::FireAndFinish]
    );
}

#[test]
fn test_result_predicates() {
    assert!(!TriggerResult::None.is_fire());
    assert!(TriggerResult::Fire.is_fire() && !TriggerResult::Fire.is_finish());
    assert!(TriggerResult::FireAndFinish.is_fire() && TriggerResult::FireAndFinish.is_finish());
}

// ── Conversion ────────────────────────────────────────────────────────────

fn proto(kind: pipeline::trigger::Kind) -> pipeline::Trigger {
    pipeline::Trigger { kind: Some(kind) }
}

#[test]
fn test_unset_trigger_compiles_to_default() {
    let t = Trigger::try_from(&pipeline::Trigger { kind: None }).unwrap();
    assert_eq!(t, Trigger::Default);
}

#[test]
fn test_nested_trigger_conversion() {
    let p = proto(pipeline::trigger::Kind::AfterEndOfWindow(
        pipeline::trigger::AfterEndOfWindow {
            early_firings: None,
            late_firings: Some(Box::new(proto(pipeline::trigger::Kind::ElementCount(
                pipeline::trigger::ElementCount { element_count: 1 },
            )))),
        },
    ));
    let t = Trigger::try_from(&p).unwrap();
    assert_eq!(
        t,
        Trigger::AfterEndOfWindow {
            early: None,
            late: Some(Box::new(Trigger::ElementCount(1))),
        }
    );
    assert_eq!(t.to_string(), "AfterEndOfWindow(late=ElementCount(1))");
}

#[test]
fn test_processing_time_triggers_are_rejected() {
    let p = proto(pipeline::trigger::Kind::AfterProcessingTime(
        pipeline::trigger::AfterProcessingTime::default(),
    ));
    let err = Trigger::try_from(&p).unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnsupportedTrigger(ref name) if name == "AfterProcessingTime"
    ));

    let nested = proto(pipeline::trigger::Kind::Repeat(pipeline::trigger::Repeat {
        subtrigger: Some(Box::new(proto(
            pipeline::trigger::Kind::AfterSynchronizedProcessingTime(
                pipeline::trigger::AfterSynchronizedProcessingTime::default(),
            ),
        ))),
    }));
    assert!(Trigger::try_from(&nested).is_err());
}

#[test]
fn test_display_composites() {
    let t = Trigger::AfterAll(vec![Trigger::ElementCount(2), Trigger::Always]);
    assert_eq!(t.to_string(), "AfterAll(ElementCount(2), Always)");
    let t = Trigger::OrFinally {
        main: Box::new(Trigger::Repeatedly(Box::new(Trigger::Always))),
        finally: Box::new(Trigger::Never),
    };
    assert_eq!(t.to_string(), "OrFinally(Repeatedly(Always), Never)");
}
