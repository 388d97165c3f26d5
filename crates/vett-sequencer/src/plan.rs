use vett_actions::InstructionPlan;
use vett_contract::TestMode;

/// Derives the run goal for the executing phase from the test mode and any
/// parsed instructions. Instructions always win; otherwise the mode selects
/// the test types to exercise.
pub fn derive_goal(mode: TestMode, instructions: Option<&InstructionPlan>) -> String {
    if let Some(plan) = instructions {
        if !plan.primary_goal.trim().is_empty() {
            let mut goal = plan.primary_goal.trim().to_string();
            if !plan.specific_actions.is_empty() {
                goal.push_str("\nSteps: ");
                goal.push_str(&plan.specific_actions.join("; "));
            }
            if !plan.expected_outcomes.is_empty() {
                goal.push_str("\nExpected: ");
                goal.push_str(&plan.expected_outcomes.join("; "));
            }
            return goal;
        }
    }
    match mode {
        TestMode::Single => {
            "Exercise the page's primary flow: find the main call to action, follow it, and \
             verify the page responds."
                .to_string()
        }
        TestMode::Multi => {
            "Test forms and navigation: fill visible forms with plausible values, submit them, \
             and follow the primary navigation links."
                .to_string()
        }
        TestMode::All => {
            "Run a full sweep: login and signup forms, general form filling, navigation, \
             accessibility of labeled controls, and visual state after each interaction."
                .to_string()
        }
        TestMode::Monkey => {
            "Stress the page: click rapidly across interactive elements, including repeated \
             clicks on the same target, and verify the page stays responsive."
                .to_string()
        }
        TestMode::Guest => {
            "Quick smoke pass: verify the page loads, the primary call to action is clickable, \
             and no errors surface."
                .to_string()
        }
        TestMode::Behavior => {
            "Follow the user's scripted behavior exactly as instructed, verifying each expected \
             outcome before moving on."
                .to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_override_mode_defaults() {
        let plan = InstructionPlan {
            primary_goal: "log in and open the dashboard".to_string(),
            specific_actions: vec!["click #login".to_string()],
            elements_to_check: Vec::new(),
            expected_outcomes: vec!["dashboard is visible".to_string()],
            priority: "high".to_string(),
            from_fallback: false,
        };
        let goal = derive_goal(TestMode::Single, Some(&plan));
        assert!(goal.starts_with("log in and open the dashboard"));
        assert!(goal.contains("click #login"));
        assert!(goal.contains("dashboard is visible"));
    }

    #[test]
    fn each_mode_has_a_distinct_default_goal() {
        let goals: Vec<String> = [
            TestMode::Single,
            TestMode::Multi,
            TestMode::All,
            TestMode::Monkey,
            TestMode::Guest,
            TestMode::Behavior,
        ]
        .into_iter()
        .map(|mode| derive_goal(mode, None))
        .collect();
        for (index, goal) in goals.iter().enumerate() {
            assert!(!goal.is_empty());
            for other in goals.iter().skip(index + 1) {
                assert_ne!(goal, other);
            }
        }
    }
}
