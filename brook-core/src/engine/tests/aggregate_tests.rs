use super::*;
use crate::coder::encode_length_prefixed;

const W: Window = Window::Interval { start: 0, end: 10 };

fn enc(s: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_length_prefixed(s.as_bytes(), &mut buf);
    buf
}

fn elem(window: Window, ts: EventTime, key: &str, value: &str) -> Element {
    let mut bytes = enc(key);
    bytes.extend(enc(value));
    Element::new(window, ts, bytes).with_key(enc(key))
}

fn strat(trigger: Trigger) -> WinStrat {
    WinStrat {
        trigger,
        ..WinStrat::default()
    }
}

fn take(agg: &mut AggregateState) -> Vec<FiredPane> {
    agg.take_ready(&BTreeSet::new())
}

fn values(pane: &FiredPane) -> Vec<Vec<u8>> {
    pane.values.clone()
}

#[test]
fn test_on_time_then_late_pane() {
    let mut holds = HoldTracker::new();
    let mut agg = AggregateState::new(WinStrat {
        allowed_lateness: 100,
        trigger: Trigger::AfterEndOfWindow {
            early: None,
            late: Some(Box::new(Trigger::ElementCount(1))),
        },
        ..WinStrat::default()
    });

    agg.add_element(elem(W, 0, "k", "x"), MIN_TIMESTAMP, &mut holds);
    assert!(!agg.has_ready());
    assert_eq!(holds.min(), Some(9));

    agg.on_watermark(10, &mut holds);
    let on_time = take(&mut agg);
    assert_eq!(on_time.len(), 1);
    assert_eq!(values(&on_time[0]), vec![enc("x")]);
    assert_eq!(on_time[0].timestamp, 9);
    assert_eq!(on_time[0].pane.timing, PaneTiming::OnTime);
    assert!(on_time[0].pane.is_first);
    assert!(!on_time[0].pane.is_last);
    // The window hold was swapped for the pane's hold.
    assert_eq!(holds.len(), 1);

    agg.add_element(elem(W, 5, "k", "y"), 10, &mut holds);
    let late = take(&mut agg);
    assert_eq!(late.len(), 1);
    assert_eq!(values(&late[0]), vec![enc("y")]);
    assert_eq!(late[0].pane.timing, PaneTiming::Late);
    assert_eq!(late[0].pane.index, 1);
    assert_eq!(late[0].pane.non_speculative_index, 1);

    agg.on_watermark(110, &mut holds);
    assert!(!agg.has_ready());
    assert_eq!(agg.open_windows(), 0);

    agg.add_element(elem(W, 5, "k", "z"), 110, &mut holds);
    assert!(!agg.has_ready());
    assert_eq!(agg.dropped(), 1);
}

#[test]
fn test_element_count_fires_once_and_closes() {
    let mut holds = HoldTracker::new();
    let mut agg = AggregateState::new(strat(Trigger::ElementCount(3)));
    for v in ["a", "b", "c"] {
        agg.add_element(elem(Window::Global, 1, "k", v), MIN_TIMESTAMP, &mut holds);
    }
    let panes = take(&mut agg);
    assert_eq!(panes.len(), 1);
    assert_eq!(values(&panes[0]), vec![enc("a"), enc("b"), enc("c")]);
    assert_eq!(panes[0].pane.timing, PaneTiming::Early);
    assert_eq!(panes[0].pane.non_speculative_index, -1);
    assert!(panes[0].pane.is_last);

    agg.add_element(elem(Window::Global, 2, "k", "d"), MIN_TIMESTAMP, &mut holds);
    assert!(!agg.has_ready());
    assert_eq!(agg.dropped(), 1);
}

#[test]
fn test_after_all_waits_for_every_child() {
    let mut holds = HoldTracker::new();
    let trigger = Trigger::AfterAll(vec![Trigger::ElementCount(2), Trigger::ElementCount(3)]);
    let mut agg = AggregateState::new(strat(trigger));
    agg.add_element(elem(Window::Global, 1, "k", "a"), MIN_TIMESTAMP, &mut holds);
    agg.add_element(elem(Window::Global, 1, "k", "b"), MIN_TIMESTAMP, &mut holds);
    assert!(!agg.has_ready());
    agg.add_element(elem(Window::Global, 1, "k", "c"), MIN_TIMESTAMP, &mut holds);
    assert_eq!(take(&mut agg).len(), 1);
}

#[test]
fn test_accumulating_panes_repeat_earlier_values() {
    let mut holds = HoldTracker::new();
    let mut agg = AggregateState::new(WinStrat {
        accumulation: Accumulation::Accumulating,
        trigger: Trigger::Repeatedly(Box::new(Trigger::ElementCount(2))),
        ..WinStrat::default()
    });
    for v in ["a", "b", "c", "d"] {
        agg.add_element(elem(Window::Global, 1, "k", v), MIN_TIMESTAMP, &mut holds);
    }
    let panes = take(&mut agg);
    assert_eq!(panes.len(), 2);
    assert_eq!(values(&panes[0]), vec![enc("a"), enc("b")]);
    assert_eq!(
        values(&panes[1]),
        vec![enc("a"), enc("b"), enc("c"), enc("d")]
    );
    assert_eq!(panes[1].pane.index, 1);
    assert!(!panes[1].pane.is_first);
}

#[test]
fn test_or_finally_fires_per_element_until_end_of_window() {
    let mut holds = HoldTracker::new();
    let trigger = Trigger::OrFinally {
        main: Box::new(Trigger::Repeatedly(Box::new(Trigger::ElementCount(1)))),
        finally: Box::new(Trigger::AfterEndOfWindow {
            early: None,
            late: None,
        }),
    };
    let mut agg = AggregateState::new(strat(trigger));
    agg.add_element(elem(W, 1, "k", "a"), MIN_TIMESTAMP, &mut holds);
    agg.add_element(elem(W, 2, "k", "b"), MIN_TIMESTAMP, &mut holds);
    let panes = take(&mut agg);
    assert_eq!(panes.len(), 2);
    assert_eq!(values(&panes[1]), vec![enc("b")]);

    agg.on_watermark(9, &mut holds);
    assert!(!agg.has_ready());
    agg.add_element(elem(W, 3, "k", "c"), 9, &mut holds);
    assert!(!agg.has_ready());
    assert_eq!(agg.dropped(), 1);
}

#[test]
fn test_earliest_in_pane_output_time() {
    let mut holds = HoldTracker::new();
    let mut agg = AggregateState::new(WinStrat {
        output_time: OutputTimePolicy::EarliestInPane,
        ..WinStrat::default()
    });
    agg.add_element(elem(W, 7, "k", "a"), MIN_TIMESTAMP, &mut holds);
    agg.add_element(elem(W, 3, "k", "b"), MIN_TIMESTAMP, &mut holds);
    assert_eq!(holds.min(), Some(3));

    agg.on_watermark(9, &mut holds);
    let panes = take(&mut agg);
    assert_eq!(panes.len(), 1);
    assert_eq!(panes[0].timestamp, 3);
    assert_eq!(holds.min(), Some(3));
}

#[test]
fn test_final_pane_on_expiry_with_never_trigger() {
    let mut holds = HoldTracker::new();
    let mut agg = AggregateState::new(strat(Trigger::Never));
    agg.add_element(elem(W, 1, "k", "a"), MIN_TIMESTAMP, &mut holds);
    agg.on_watermark(9, &mut holds);
    assert!(!agg.has_ready());

    agg.on_watermark(10, &mut holds);
    let panes = take(&mut agg);
    assert_eq!(panes.len(), 1);
    assert!(panes[0].pane.is_last);
    assert_eq!(agg.open_windows(), 0);
}

#[test]
fn test_busy_keys_stay_queued_in_order() {
    let mut holds = HoldTracker::new();
    let mut agg = AggregateState::new(strat(Trigger::Repeatedly(Box::new(
        Trigger::ElementCount(1),
    ))));
    agg.add_element(elem(W, 1, "a", "1"), MIN_TIMESTAMP, &mut holds);
    agg.add_element(elem(W, 1, "b", "1"), MIN_TIMESTAMP, &mut holds);
    agg.add_element(elem(W, 2, "a", "2"), MIN_TIMESTAMP, &mut holds);

    let busy = BTreeSet::from([enc("a")]);
    let taken = agg.take_ready(&busy);
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].key, enc("b"));

    agg.return_panes(taken);
    let all = take(&mut agg);
    let order: Vec<(Vec<u8>, Vec<Vec<u8>>)> =
        all.iter().map(|p| (p.key.clone(), p.values.clone())).collect();
    assert_eq!(
        order,
        vec![
            (enc("b"), vec![enc("1")]),
            (enc("a"), vec![enc("1")]),
            (enc("a"), vec![enc("2")]),
        ]
    );
}

#[test]
fn test_windows_near_end_of_time_do_not_overflow() {
    let mut holds = HoldTracker::new();
    let mut agg = AggregateState::new(WinStrat {
        allowed_lateness: EventTime::MAX,
        ..WinStrat::default()
    });
    agg.add_element(elem(Window::Global, MAX_TIMESTAMP, "k", "a"), MIN_TIMESTAMP, &mut holds);
    agg.on_watermark(MAX_TIMESTAMP, &mut holds);
    let panes = take(&mut agg);
    assert_eq!(panes.len(), 1);
    assert_eq!(panes[0].timestamp, Window::Global.max_timestamp());
    assert_eq!(agg.open_windows(), 0);
}
