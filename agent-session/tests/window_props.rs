//! Property coverage for the pure windowing and sanitization functions.

use agent_session::event::{apply_window, sanitize_user_anchor};
use agent_session::{Event, Response, Role, SessionOptions};
use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

fn arb_role() -> impl Strategy<Value = Option<Role>> {
    prop_oneof![
        Just(Some(Role::User)),
        Just(Some(Role::Assistant)),
        Just(Some(Role::System)),
        Just(Some(Role::Tool)),
        // No response at all.
        Just(None),
    ]
}

fn arb_events() -> impl Strategy<Value = Vec<Event>> {
    prop::collection::vec((arb_role(), 0i64..500), 0..40).prop_map(|specs| {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut offsets: Vec<i64> = specs.iter().map(|(_, off)| *off).collect();
        offsets.sort_unstable();
        specs
            .into_iter()
            .zip(offsets)
            .enumerate()
            .map(|(i, ((role, _), off))| {
                let mut ev = Event::new("agent").with_timestamp(base + Duration::seconds(off));
                if let Some(role) = role {
                    ev = ev.with_response(Response::with_message(role, format!("m{i}")));
                }
                ev
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn window_is_empty_or_starts_with_user(
        events in arb_events(),
        num in 0usize..10,
        time_off in 0i64..600,
    ) {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let options = SessionOptions::new()
            .with_event_num(num)
            .with_event_time(base + Duration::seconds(time_off));

        let mut window = events;
        apply_window(&mut window, &options);
        sanitize_user_anchor(&mut window);

        if let Some(first) = window.first() {
            prop_assert_eq!(first.first_choice_role(), Some(Role::User));
        }
    }

    #[test]
    fn count_limit_bounds_the_window(events in arb_events(), num in 1usize..10) {
        let mut window = events;
        apply_window(&mut window, &SessionOptions::new().with_event_num(num));
        prop_assert!(window.len() <= num);
    }

    #[test]
    fn time_filter_drops_everything_older(events in arb_events(), time_off in 0i64..600) {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let cutoff = base + Duration::seconds(time_off);

        let mut window = events;
        apply_window(&mut window, &SessionOptions::new().with_event_time(cutoff));
        prop_assert!(window.iter().all(|e| e.timestamp >= cutoff));
    }

    #[test]
    fn filters_preserve_order_and_yield_a_subsequence(
        events in arb_events(),
        num in 0usize..10,
    ) {
        let original_ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();

        let mut window = events;
        apply_window(&mut window, &SessionOptions::new().with_event_num(num));
        sanitize_user_anchor(&mut window);

        // Every surviving event appears in the original, in the same order.
        let mut cursor = 0;
        for ev in &window {
            let pos = original_ids[cursor..].iter().position(|id| *id == ev.id);
            prop_assert!(pos.is_some());
            cursor += pos.unwrap() + 1;
        }
    }

    #[test]
    fn zero_count_never_trims(events in arb_events()) {
        let len = events.len();
        let mut window = events;
        apply_window(&mut window, &SessionOptions::new().with_event_num(0));
        prop_assert_eq!(window.len(), len);
    }
}
