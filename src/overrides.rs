//! Command-line property overrides.
//!
//! `--set "Andor SimCam.exposureTime=0.2"` replaces the value of an existing
//! property before the model is loaded. The text is converted to the type of
//! the value it replaces, so `0.2` stays a float and `1,1` becomes a
//! sequence of integers when the declared binning is `[2, 2]`.

use crate::declaration::{RawChild, RawChildren, RawDeclaration};
use crate::error::{ResolveError, ValidationErrors};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// One `Component.property=value` assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyOverride {
    pub component: String,
    pub property: String,
    /// Unparsed replacement value.
    pub text: String,
}

impl FromStr for PropertyOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, text) = s
            .split_once('=')
            .ok_or_else(|| format!("expected Component.property=value, got '{}'", s))?;
        // Component names may contain dots, property names do not.
        let (component, property) = target
            .rsplit_once('.')
            .ok_or_else(|| format!("expected Component.property before '=', got '{}'", target))?;
        if component.is_empty() || property.is_empty() {
            return Err(format!("empty component or property name in '{}'", s));
        }
        Ok(Self {
            component: component.to_string(),
            property: property.to_string(),
            text: text.to_string(),
        })
    }
}

impl fmt::Display for PropertyOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.component, self.property, self.text)
    }
}

/// Rewrite `properties` of the raw entries in place.
///
/// Inline children are addressed by their flattened name. Every failing
/// override is reported.
pub fn apply_overrides(
    entries: &mut [(String, RawDeclaration)],
    overrides: &[PropertyOverride],
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    for o in overrides {
        let Some(decl) = find_declaration(entries, &o.component) else {
            errors.push(ResolveError::MalformedDeclaration {
                name: o.component.clone(),
                reason: format!("cannot override '{}': no such component", o.property),
            });
            continue;
        };
        let Some(current) = decl.properties.get_mut(&o.property) else {
            errors.push(ResolveError::MalformedDeclaration {
                name: o.component.clone(),
                reason: format!("cannot override unknown property '{}'", o.property),
            });
            continue;
        };
        match current.parse_like(&o.text) {
            Ok(value) => {
                debug!(component = %o.component, property = %o.property, %value, "Overriding property");
                *current = value;
            }
            Err(e) => errors.push(ResolveError::MalformedDeclaration {
                name: o.component.clone(),
                reason: format!("cannot override '{}': {}", o.property, e),
            }),
        }
    }

    errors.into_result(())
}

fn find_declaration<'a>(
    entries: &'a mut [(String, RawDeclaration)],
    component: &str,
) -> Option<&'a mut RawDeclaration> {
    for (name, decl) in entries.iter_mut() {
        if name == component {
            return Some(decl);
        }
        if let Some(found) = find_inline(name, decl, component) {
            return Some(found);
        }
    }
    None
}

fn find_inline<'a>(
    parent: &str,
    decl: &'a mut RawDeclaration,
    component: &str,
) -> Option<&'a mut RawDeclaration> {
    let RawChildren::Slots(slots) = &mut decl.children else {
        return None;
    };
    for (slot, child) in slots.iter_mut() {
        let RawChild::Inline(inline) = child else {
            continue;
        };
        let name = inline
            .name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", parent, slot));
        if name == component {
            return Some(inline.as_mut());
        }
        if let Some(found) = find_inline(&name, inline, component) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn entries() -> Vec<(String, RawDeclaration)> {
        vec![
            (
                "Andor SimCam".to_string(),
                RawDeclaration::with_class("andorcam2.FakeAndorCam2")
                    .property("exposureTime", 0.1)
                    .property("binning", Value::Sequence(vec![Value::Int(2), Value::Int(2)])),
            ),
            (
                "SEM E-beam".to_string(),
                RawDeclaration::with_class("simsem.SimSEM").inline_child(
                    "scanner",
                    RawDeclaration::default().property("dwellTime", 1e-6),
                ),
            ),
        ]
    }

    #[test]
    fn test_parse_override() {
        let o: PropertyOverride = "SEM E-beam.scanner.dwellTime=2e-6".parse().unwrap();
        assert_eq!(o.component, "SEM E-beam.scanner");
        assert_eq!(o.property, "dwellTime");
        assert_eq!(o.text, "2e-6");

        let o: PropertyOverride = "Cam.roi=a=b".parse().unwrap();
        assert_eq!(o.text, "a=b");
    }

    #[test]
    fn test_parse_override_rejects_bad_syntax() {
        assert!("Cam.exposure".parse::<PropertyOverride>().is_err());
        assert!("exposure=1".parse::<PropertyOverride>().is_err());
        assert!(".exposure=1".parse::<PropertyOverride>().is_err());
    }

    #[test]
    fn test_apply_coerces_to_existing_type() {
        let mut entries = entries();
        let overrides = vec![
            "Andor SimCam.exposureTime=0.25".parse().unwrap(),
            "Andor SimCam.binning=1,4".parse().unwrap(),
            "SEM E-beam.scanner.dwellTime=2e-6".parse().unwrap(),
        ];
        apply_overrides(&mut entries, &overrides).unwrap();

        let cam = &entries[0].1;
        assert_eq!(cam.properties["exposureTime"], Value::Float(0.25));
        assert_eq!(
            cam.properties["binning"],
            Value::Sequence(vec![Value::Int(1), Value::Int(4)])
        );
        match &entries[1].1.children {
            RawChildren::Slots(slots) => match &slots["scanner"] {
                RawChild::Inline(scanner) => {
                    assert_eq!(scanner.properties["dwellTime"], Value::Float(2e-6))
                }
                other => panic!("unexpected child: {:?}", other),
            },
            other => panic!("unexpected children: {:?}", other),
        }
    }

    #[test]
    fn test_apply_reports_every_failure() {
        let mut entries = entries();
        let overrides = vec![
            "Missing.exposureTime=1".parse().unwrap(),
            "Andor SimCam.gain=1".parse().unwrap(),
            "Andor SimCam.exposureTime=fast".parse().unwrap(),
        ];
        let errors = apply_overrides(&mut entries, &overrides).unwrap_err();

        assert_eq!(errors.len(), 3);
        assert!(errors
            .iter()
            .all(|e| matches!(e, ResolveError::MalformedDeclaration { .. })));
        // Failed overrides leave the declaration untouched.
        assert_eq!(entries[0].1.properties["exposureTime"], Value::Float(0.1));
    }
}
