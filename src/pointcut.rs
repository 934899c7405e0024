//! Pointcut descriptors: which classes and methods an advisor applies to.
//!
//! Name patterns accept an exact name, `*` wildcards, `a|b|c` alternation of
//! those, or a `/regex/`. A [`PointcutDescriptor`] serializes back to the
//! same camelCase JSON it was read from.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::classfile::{ACC_PRIVATE, ACC_PROTECTED, ACC_PUBLIC, ACC_STATIC};
use crate::error::ConfigError;

/// Matches any remaining parameters in `methodParameterTypes`.
pub const ANY_REMAINING_PARAMETERS: &str = "..";

#[derive(Debug, Clone)]
pub enum NamePattern {
    Exact(String),
    Wildcard { source: String, regex: Regex },
    Alternation(Vec<NamePattern>),
    Regex { source: String, regex: Regex },
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let pattern = pattern.trim();
        if pattern.len() > 1 && pattern.starts_with('/') && pattern.ends_with('/') {
            let body = &pattern[1..pattern.len() - 1];
            return Ok(NamePattern::Regex {
                source: pattern.to_string(),
                regex: compile(pattern, &format!("^(?:{body})$"))?,
            });
        }
        if pattern.contains('|') {
            let parts = pattern
                .split('|')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(Self::parse_simple)
                .collect::<Result<Vec<_>, _>>()?;
            if parts.is_empty() {
                return Err(ConfigError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "empty alternation".to_string(),
                });
            }
            return Ok(NamePattern::Alternation(parts));
        }
        Self::parse_simple(pattern)
    }

    /// `None` for an empty pattern.
    pub fn parse_optional(pattern: &str) -> Result<Option<Self>, ConfigError> {
        if pattern.trim().is_empty() {
            Ok(None)
        } else {
            Self::parse(pattern).map(Some)
        }
    }

    fn parse_simple(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.is_empty() {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty name".to_string(),
            });
        }
        if !pattern.contains('*') {
            return Ok(NamePattern::Exact(pattern.to_string()));
        }
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Ok(NamePattern::Wildcard {
            source: pattern.to_string(),
            regex: compile(pattern, &format!("^{body}$"))?,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(exact) => exact == name,
            NamePattern::Wildcard { regex, .. } | NamePattern::Regex { regex, .. } => {
                regex.is_match(name)
            }
            NamePattern::Alternation(parts) => parts.iter().any(|p| p.matches(name)),
        }
    }

    pub fn is_exact(&self, name: &str) -> bool {
        matches!(self, NamePattern::Exact(exact) if exact == name)
    }

    pub fn source(&self) -> String {
        match self {
            NamePattern::Exact(s) => s.clone(),
            NamePattern::Wildcard { source, .. } | NamePattern::Regex { source, .. } => {
                source.clone()
            }
            NamePattern::Alternation(parts) => parts
                .iter()
                .map(NamePattern::source)
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}

fn compile(source: &str, regex: &str) -> Result<Regex, ConfigError> {
    Regex::new(regex).map_err(|e| ConfigError::InvalidPattern {
        pattern: source.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodModifier {
    Public,
    Protected,
    Private,
    Static,
    NotStatic,
}

impl MethodModifier {
    fn accepts(self, access: u16) -> bool {
        match self {
            MethodModifier::Public => access & ACC_PUBLIC != 0,
            MethodModifier::Protected => access & ACC_PROTECTED != 0,
            MethodModifier::Private => access & ACC_PRIVATE != 0,
            MethodModifier::Static => access & ACC_STATIC != 0,
            MethodModifier::NotStatic => access & ACC_STATIC == 0,
        }
    }
}

/// The raw, serializable form of a pointcut.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PointcutSpec {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub class_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub class_annotation: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sub_type_restriction: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub super_type_restriction: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method_annotation: String,
    /// Empty means "no parameters"; use `..` to accept any.
    pub method_parameter_types: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method_return_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub method_modifiers: Vec<MethodModifier>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub nesting_group: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub order: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timer_name: String,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

#[derive(Debug, Clone)]
enum ParameterPattern {
    AnyRemaining,
    Type(NamePattern),
}

/// A class as seen by pointcut matching.
#[derive(Debug, Clone, Copy)]
pub struct TypeView<'a> {
    /// Java name, e.g. `com.example.Foo`.
    pub name: &'a str,
    pub annotations: &'a [String],
}

/// A method as seen by pointcut matching.
#[derive(Debug, Clone, Copy)]
pub struct MethodView<'a> {
    pub name: &'a str,
    pub parameter_types: &'a [String],
    pub return_type: &'a str,
    pub access: u16,
    pub annotations: &'a [String],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PointcutSpec", into = "PointcutSpec")]
pub struct PointcutDescriptor {
    spec: PointcutSpec,
    class_name: Option<NamePattern>,
    class_annotation: Option<NamePattern>,
    sub_type_restriction: Option<NamePattern>,
    super_type_restriction: Option<NamePattern>,
    method_name: Option<NamePattern>,
    method_annotation: Option<NamePattern>,
    parameter_types: Vec<ParameterPattern>,
    return_type: Option<NamePattern>,
}

impl TryFrom<PointcutSpec> for PointcutDescriptor {
    type Error = ConfigError;

    fn try_from(spec: PointcutSpec) -> Result<Self, ConfigError> {
        let mut parameter_types = Vec::with_capacity(spec.method_parameter_types.len());
        for (i, p) in spec.method_parameter_types.iter().enumerate() {
            if p.trim() == ANY_REMAINING_PARAMETERS {
                if i + 1 != spec.method_parameter_types.len() {
                    return Err(ConfigError::InvalidPattern {
                        pattern: p.clone(),
                        reason: "'..' must be the last parameter type".to_string(),
                    });
                }
                parameter_types.push(ParameterPattern::AnyRemaining);
            } else {
                parameter_types.push(ParameterPattern::Type(NamePattern::parse(p)?));
            }
        }
        Ok(Self {
            class_name: NamePattern::parse_optional(&spec.class_name)?,
            class_annotation: NamePattern::parse_optional(&spec.class_annotation)?,
            sub_type_restriction: NamePattern::parse_optional(&spec.sub_type_restriction)?,
            super_type_restriction: NamePattern::parse_optional(&spec.super_type_restriction)?,
            method_name: NamePattern::parse_optional(&spec.method_name)?,
            method_annotation: NamePattern::parse_optional(&spec.method_annotation)?,
            parameter_types,
            return_type: NamePattern::parse_optional(&spec.method_return_type)?,
            spec,
        })
    }
}

impl From<PointcutDescriptor> for PointcutSpec {
    fn from(descriptor: PointcutDescriptor) -> Self {
        descriptor.spec
    }
}

impl PointcutDescriptor {
    pub fn spec(&self) -> &PointcutSpec {
        &self.spec
    }

    pub fn timer_name(&self) -> &str {
        &self.spec.timer_name
    }

    pub fn nesting_group(&self) -> Option<&str> {
        (!self.spec.nesting_group.is_empty()).then_some(self.spec.nesting_group.as_str())
    }

    pub fn order(&self) -> i32 {
        self.spec.order
    }

    pub fn targets_constructor(&self) -> bool {
        self.method_name.as_ref().is_some_and(|p| p.is_exact("<init>"))
    }

    /// Whether the class (or, except for constructor pointcuts, any of its
    /// ancestors) satisfies the class name/annotation, and the class
    /// satisfies the sub/super type restrictions.
    pub fn class_matches(&self, class: TypeView<'_>, ancestors: &[TypeView<'_>]) -> bool {
        let candidate = |t: &TypeView<'_>| {
            self.class_name.as_ref().is_none_or(|p| p.matches(t.name))
                && self
                    .class_annotation
                    .as_ref()
                    .is_none_or(|p| t.annotations.iter().any(|a| p.matches(a)))
        };
        let base = candidate(&class) || (!self.targets_constructor() && ancestors.iter().any(candidate));
        if !base {
            return false;
        }
        let sub_ok = self
            .sub_type_restriction
            .as_ref()
            .is_none_or(|p| p.matches(class.name) || ancestors.iter().any(|a| p.matches(a.name)));
        let super_ok = self
            .super_type_restriction
            .as_ref()
            .is_none_or(|p| ancestors.iter().any(|a| p.matches(a.name)));
        sub_ok && super_ok
    }

    pub fn method_matches(&self, method: MethodView<'_>) -> bool {
        if method.name == "<clinit>" {
            return false;
        }
        if method.name == "<init>" && !self.targets_constructor() {
            return false;
        }
        if !self.method_name.as_ref().is_none_or(|p| p.matches(method.name)) {
            return false;
        }
        if !self
            .method_annotation
            .as_ref()
            .is_none_or(|p| method.annotations.iter().any(|a| p.matches(a)))
        {
            return false;
        }
        if !self.return_type.as_ref().is_none_or(|p| p.matches(method.return_type)) {
            return false;
        }
        if !self.spec.method_modifiers.iter().all(|m| m.accepts(method.access)) {
            return false;
        }
        self.parameters_match(method.parameter_types)
    }

    fn parameters_match(&self, parameters: &[String]) -> bool {
        for (i, pattern) in self.parameter_types.iter().enumerate() {
            match pattern {
                ParameterPattern::AnyRemaining => return true,
                ParameterPattern::Type(p) => match parameters.get(i) {
                    Some(actual) if p.matches(actual) => {}
                    _ => return false,
                },
            }
        }
        self.parameter_types.len() == parameters.len()
    }

    /// Class-level selector used to find already-loaded classes affected by
    /// this pointcut.
    pub fn class_selector(&self) -> Option<PointcutClassName> {
        let (selector, by_annotation) = match (&self.class_name, &self.class_annotation) {
            (Some(name), _) => (name.clone(), false),
            (None, Some(annotation)) => (annotation.clone(), true),
            (None, None) => return None,
        };
        Some(PointcutClassName {
            selector,
            by_annotation,
            sub_type_restriction: self.sub_type_restriction.clone(),
            match_sub_classes: !self.targets_constructor(),
        })
    }
}

/// A loaded class as seen by [`PointcutClassName::applies_to`].
#[derive(Debug, Clone, Copy)]
pub struct LoadedTypeView<'a> {
    pub name: &'a str,
    pub annotations: &'a [String],
}

#[derive(Debug, Clone)]
pub struct PointcutClassName {
    selector: NamePattern,
    by_annotation: bool,
    sub_type_restriction: Option<NamePattern>,
    match_sub_classes: bool,
}

impl PointcutClassName {
    pub fn applies_to(&self, class: LoadedTypeView<'_>, ancestors: &[LoadedTypeView<'_>]) -> bool {
        let selected = |t: &LoadedTypeView<'_>| {
            if self.by_annotation {
                t.annotations.iter().any(|a| self.selector.matches(a))
            } else {
                self.selector.matches(t.name)
            }
        };
        let base = selected(&class) || (self.match_sub_classes && ancestors.iter().any(selected));
        base && self
            .sub_type_restriction
            .as_ref()
            .is_none_or(|p| p.matches(class.name) || ancestors.iter().any(|a| p.matches(a.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointcut(json: &str) -> PointcutDescriptor {
        serde_json::from_str(json).expect("valid pointcut")
    }

    fn method<'a>(name: &'a str, params: &'a [String]) -> MethodView<'a> {
        MethodView {
            name,
            parameter_types: params,
            return_type: "void",
            access: ACC_PUBLIC,
            annotations: &[],
        }
    }

    fn class(name: &str) -> TypeView<'_> {
        TypeView {
            name,
            annotations: &[],
        }
    }

    #[test]
    fn name_patterns_cover_exact_wildcard_alternation_and_regex() -> Result<(), ConfigError> {
        assert!(NamePattern::parse("com.example.Foo")?.matches("com.example.Foo"));
        assert!(!NamePattern::parse("com.example.Foo")?.matches("com.example.FooBar"));
        let wildcard = NamePattern::parse("com.example.*Dao")?;
        assert!(wildcard.matches("com.example.UserDao"));
        assert!(!wildcard.matches("com.example.UserDao2"));
        let alt = NamePattern::parse("get*|set*|is")?;
        assert!(alt.matches("getName") && alt.matches("setName") && alt.matches("is"));
        assert!(!alt.matches("isValid"));
        assert_eq!(alt.source(), "get*|set*|is");
        let regex = NamePattern::parse("/execute(Query|Update)?/")?;
        assert!(regex.matches("executeQuery") && regex.matches("execute"));
        assert!(!regex.matches("executeBatch"));
        assert!(NamePattern::parse("/(/").is_err());
        assert!(NamePattern::parse_optional("  ")?.is_none());
        // dots are literal in wildcards
        assert!(!NamePattern::parse("a.b*")?.matches("aXb"));
        Ok(())
    }

    #[test]
    fn empty_parameter_list_means_no_arg_only() {
        let p = pointcut(r#"{"className":"com.example.Foo","methodName":"bar","timerName":"t"}"#);
        assert!(p.method_matches(method("bar", &[])));
        assert!(!p.method_matches(method("bar", &["int".to_string()])));

        let any = pointcut(r#"{"className":"x.Y","methodName":"bar","methodParameterTypes":["int",".."]}"#);
        assert!(any.method_matches(method("bar", &["int".into(), "long".into(), "x".into()])));
        assert!(!any.method_matches(method("bar", &[])));
    }

    #[test]
    fn dot_dot_must_be_last() {
        let r: Result<PointcutDescriptor, _> =
            serde_json::from_str(r#"{"className":"x.Y","methodName":"m","methodParameterTypes":["..","int"]}"#);
        assert!(r.is_err());
    }

    #[test]
    fn ancestors_match_unless_restricted_or_constructor() {
        let p = pointcut(r#"{"className":"java.lang.Runnable","methodName":"run"}"#);
        let ancestors = [class("java.lang.Object"), class("java.lang.Runnable")];
        assert!(p.class_matches(class("com.example.Task"), &ancestors));

        let restricted = pointcut(
            r#"{"className":"java.lang.Runnable","subTypeRestriction":"org.other.*","methodName":"run"}"#,
        );
        assert!(!restricted.class_matches(class("com.example.Task"), &ancestors));
        assert!(restricted.class_matches(class("org.other.Task"), &ancestors));

        let ctor = pointcut(r#"{"className":"java.lang.Runnable","methodName":"<init>"}"#);
        assert!(!ctor.class_matches(class("com.example.Task"), &ancestors));
        assert!(ctor.method_matches(method("<init>", &[])));
        assert!(!p.method_matches(method("<init>", &[])));
        assert!(!pointcut(r#"{"className":"x.Y","methodName":"*"}"#).method_matches(method("<clinit>", &[])));
    }

    #[test]
    fn modifiers_and_annotations_filter_methods() {
        let p = pointcut(
            r#"{"classAnnotation":"com.example.Traced","methodAnnotation":"com.example.Timed","methodParameterTypes":[".."],"methodModifiers":["public","not-static"]}"#,
        );
        let annotations = ["com.example.Traced".to_string()];
        let annotated = TypeView {
            name: "com.example.Svc",
            annotations: &annotations,
        };
        assert!(p.class_matches(annotated, &[]));
        assert!(!p.class_matches(class("com.example.Svc"), &[]));

        let timed = ["com.example.Timed".to_string()];
        let mut m = method("go", &[]);
        assert!(!p.method_matches(m));
        m.annotations = &timed;
        assert!(p.method_matches(m));
        m.access = ACC_PUBLIC | ACC_STATIC;
        assert!(!p.method_matches(m));
    }

    #[test]
    fn serialized_descriptor_reloads_with_identical_matching() -> anyhow::Result<()> {
        let original = pointcut(
            r#"{"className":"com.example.*Service|com.example.Foo","methodName":"/get.*/","methodParameterTypes":["java.lang.String",".."],"nestingGroup":"svc","order":3,"timerName":"svc call"}"#,
        );
        let json = serde_json::to_string(&original)?;
        let reloaded: PointcutDescriptor = serde_json::from_str(&json)?;
        assert_eq!(reloaded.spec(), original.spec());

        let names = ["com.example.UserService", "com.example.Foo", "com.example.Bar"];
        let methods = ["getUser", "get", "put"];
        let params = [vec![], vec!["java.lang.String".to_string()], vec!["int".to_string()]];
        for n in names {
            assert_eq!(
                original.class_matches(class(n), &[]),
                reloaded.class_matches(class(n), &[])
            );
            for m in methods {
                for p in &params {
                    assert_eq!(
                        original.method_matches(method(m, p)),
                        reloaded.method_matches(method(m, p))
                    );
                }
            }
        }
        assert_eq!(reloaded.nesting_group(), Some("svc"));
        Ok(())
    }

    #[test]
    fn class_selector_follows_annotations_and_subclasses() {
        let by_name = pointcut(r#"{"className":"com.example.Base","methodName":"run"}"#)
            .class_selector()
            .expect("selector");
        let sub = LoadedTypeView {
            name: "com.example.Impl",
            annotations: &[],
        };
        let base = LoadedTypeView {
            name: "com.example.Base",
            annotations: &[],
        };
        assert!(by_name.applies_to(sub, &[base]));
        assert!(!by_name.applies_to(sub, &[]));
    }
}
