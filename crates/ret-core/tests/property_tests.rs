use proptest::prelude::*;
use ret_core::state::{allowed_transitions, validate_transition};
use ret_core::ResolutionState;
use ret_test_utils::{inbound, minutes, three_stage_policy, TestHarness, CONVERSATION, EMPLOYEE};
use std::collections::HashMap;
use std::time::Duration;

const THRESHOLDS: [(&str, u64); 3] = [("w1", 5 * 60), ("w2", 15 * 60), ("w3", 30 * 60)];

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

fn any_state() -> impl Strategy<Value = ResolutionState> {
    prop_oneof![
        Just(ResolutionState::Pending),
        Just(ResolutionState::Responded),
        Just(ResolutionState::Expired),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reply_time_decides_which_stages_deliver(reply_after_secs in 0u64..2400) {
        let rt = paused_runtime();
        let (deliveries, state) = rt.block_on(async {
            let h = TestHarness::new(three_stage_policy());
            let handle = h.registry.track(&inbound(1), EMPLOYEE).await.unwrap();

            tokio::time::sleep(Duration::from_secs(reply_after_secs)).await;
            h.registry.resolve(CONVERSATION, EMPLOYEE).await.unwrap();
            tokio::time::sleep(minutes(60)).await;

            (h.notifier.deliveries(), h.record(&handle.key()).unwrap().state)
        });

        prop_assert_eq!(state, ResolutionState::Responded);

        let mut per_stage: HashMap<&str, usize> = HashMap::new();
        for d in &deliveries {
            *per_stage.entry(d.stage_label.as_str()).or_default() += 1;
            // Nothing is delivered after the reply
            prop_assert!(d.at <= Duration::from_secs(reply_after_secs));
        }

        for (label, threshold) in THRESHOLDS {
            let count = per_stage.get(label).copied().unwrap_or(0);
            prop_assert!(count <= 1, "stage {} delivered {} times", label, count);
            if threshold < reply_after_secs {
                prop_assert_eq!(count, 1, "stage {} should have fired", label);
            } else if threshold > reply_after_secs {
                prop_assert_eq!(count, 0, "stage {} should have been canceled", label);
            }
        }
    }

    #[test]
    fn transitions_match_allowed_table(from in any_state(), to in any_state()) {
        let allowed = allowed_transitions(from);
        prop_assert_eq!(validate_transition(from, to).is_ok(), allowed.contains(&to));
        // Nothing ever leads back to pending
        prop_assert!(!allowed.contains(&ResolutionState::Pending));
    }
}
