//! Decides which advisors apply to which methods of an analyzed class.

use std::sync::Arc;

use crate::advice::{Advisor, AdvisorId};
use crate::classfile::{ACC_ABSTRACT, ACC_BRIDGE, ACC_NATIVE};
use crate::pointcut::{MethodView, TypeView};

/// Methods the weaver can instrument at all.
pub fn is_weavable_method(name: &str, access: u16, has_code: bool) -> bool {
    has_code && name != "<clinit>" && access & (ACC_ABSTRACT | ACC_NATIVE | ACC_BRIDGE) == 0
}

/// Orders by `(order, declaration index)` and drops repeated ids.
pub fn sort_advisors(advisors: &mut Vec<Arc<Advisor>>) {
    advisors.sort_by_key(|a| (a.sort_key(), a.id));
    advisors.dedup_by_key(|a| a.id);
}

#[derive(Debug, Clone)]
pub struct AdviceMatcher {
    advisors: Vec<Arc<Advisor>>,
}

impl AdviceMatcher {
    pub fn new(advisors: Vec<Arc<Advisor>>) -> Self {
        Self { advisors }
    }

    /// Advisors whose class-level conditions hold for `class`.
    pub fn class_advisors(&self, class: TypeView<'_>, ancestors: &[TypeView<'_>]) -> Vec<Arc<Advisor>> {
        self.advisors
            .iter()
            .filter(|a| a.pointcut.class_matches(class, ancestors))
            .cloned()
            .collect()
    }

    /// Advisors for one method, already narrowed to the class level.
    pub fn method_advisors(
        class_advisors: &[Arc<Advisor>],
        method: MethodView<'_>,
        has_code: bool,
    ) -> Vec<Arc<Advisor>> {
        if !is_weavable_method(method.name, method.access, has_code) {
            return Vec::new();
        }
        let mut matched: Vec<Arc<Advisor>> = class_advisors
            .iter()
            .filter(|a| a.pointcut.method_matches(method))
            .cloned()
            .collect();
        sort_advisors(&mut matched);
        matched
    }

    pub fn ids(advisors: &[Arc<Advisor>]) -> Vec<AdvisorId> {
        advisors.iter().map(|a| a.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ACC_PUBLIC;
    use crate::config::{AdviceConfig, CaptureKind};
    use crate::pointcut::PointcutSpec;

    fn advisor(id: AdvisorId, class_name: &str, method: &str, order: i32) -> Arc<Advisor> {
        let config = AdviceConfig {
            pointcut: PointcutSpec {
                class_name: class_name.to_string(),
                method_name: method.to_string(),
                timer_name: format!("t{id}"),
                order,
                ..PointcutSpec::default()
            },
            capture_kind: CaptureKind::Timer,
            ..AdviceConfig::default()
        };
        Arc::new(Advisor::build(id, &config, id as usize, true, "").expect("advisor"))
    }

    fn view<'a>(name: &'a str, access: u16) -> MethodView<'a> {
        MethodView {
            name,
            parameter_types: &[],
            return_type: "void",
            access,
            annotations: &[],
        }
    }

    #[test]
    fn matches_are_ordered_and_stable() {
        let matcher = AdviceMatcher::new(vec![
            advisor(0, "com.example.*", "run", 5),
            advisor(1, "com.example.Foo", "run|stop", 0),
            advisor(2, "com.other.Foo", "run", 0),
        ]);
        let class = TypeView {
            name: "com.example.Foo",
            annotations: &[],
        };
        let class_level = matcher.class_advisors(class, &[]);
        assert_eq!(AdviceMatcher::ids(&class_level), vec![0, 1]);

        let first = AdviceMatcher::method_advisors(&class_level, view("run", ACC_PUBLIC), true);
        let second = AdviceMatcher::method_advisors(&class_level, view("run", ACC_PUBLIC), true);
        assert_eq!(AdviceMatcher::ids(&first), vec![1, 0]);
        assert_eq!(AdviceMatcher::ids(&first), AdviceMatcher::ids(&second));
        assert_eq!(
            AdviceMatcher::ids(&AdviceMatcher::method_advisors(&class_level, view("stop", ACC_PUBLIC), true)),
            vec![1]
        );
    }

    #[test]
    fn unweavable_methods_never_match() {
        let class_level = vec![advisor(0, "com.example.Foo", "*", 0)];
        assert!(AdviceMatcher::method_advisors(&class_level, view("run", ACC_PUBLIC), false).is_empty());
        assert!(
            AdviceMatcher::method_advisors(&class_level, view("run", ACC_PUBLIC | ACC_BRIDGE), true).is_empty()
        );
        assert!(AdviceMatcher::method_advisors(&class_level, view("<clinit>", 0), true).is_empty());
        assert_eq!(
            AdviceMatcher::method_advisors(&class_level, view("run", ACC_PUBLIC), true).len(),
            1
        );
    }
}
