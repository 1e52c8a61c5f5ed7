//! Parser for message definition text.
//!
//! A definition is a list of lines, each either a field (`type name`), a
//! constant (`type NAME=value`), a comment or blank. The parser produces
//! unresolved declarations; [`crate::descriptor::TypeDescriptor::parse`]
//! resolves nested type names against the registry.

use crate::field::{Cardinality, PrimitiveType};
use rosgraph_types::{RosError, RosResult};

/// Bare `Header` always means this type.
pub const HEADER_TYPE: &str = "std_msgs/Header";

/// Line separating request and response in a service definition.
pub const SERVICE_SEPARATOR: &str = "---";

/// One parsed, not yet resolved, line of a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Field {
        /// Element type with array suffix removed, package-qualified for
        /// message types.
        base_type: String,
        /// Type exactly as written (array suffix kept).
        type_token: String,
        cardinality: Cardinality,
        name: String,
    },
    Constant {
        primitive: PrimitiveType,
        type_token: String,
        name: String,
        value: String,
    },
}

/// Package part of `pkg/Name`, if any.
pub fn package_of(type_name: &str) -> Option<&str> {
    type_name.rsplit_once('/').map(|(pkg, _)| pkg)
}

/// Split a service definition into its request and response halves.
pub fn split_service(type_name: &str, definition: &str) -> RosResult<(String, String)> {
    let mut request = Vec::new();
    let mut response = Vec::new();
    let mut seen_separator = false;
    for line in definition.lines() {
        if line.trim() == SERVICE_SEPARATOR {
            if seen_separator {
                return Err(invalid(type_name, "more than one '---' separator"));
            }
            seen_separator = true;
            continue;
        }
        if seen_separator {
            response.push(line);
        } else {
            request.push(line);
        }
    }
    if !seen_separator {
        return Err(invalid(type_name, "service definition lacks '---' separator"));
    }
    Ok((request.join("\n"), response.join("\n")))
}

/// Parse definition text declared for `type_name`.
pub fn parse_definition(type_name: &str, text: &str) -> RosResult<Vec<Declaration>> {
    let package = package_of(type_name);
    let mut declarations = Vec::new();
    let mut names: Vec<String> = Vec::new();

    for (lineno, raw) in text.lines().enumerate() {
        let Some(decl) = parse_line(type_name, package, raw)
            .map_err(|reason| invalid(type_name, &format!("line {}: {reason}", lineno + 1)))?
        else {
            continue;
        };
        let name = match &decl {
            Declaration::Field { name, .. } | Declaration::Constant { name, .. } => name,
        };
        if names.iter().any(|n| n == name) {
            return Err(invalid(type_name, &format!("duplicate name '{name}'")));
        }
        names.push(name.clone());
        declarations.push(decl);
    }
    Ok(declarations)
}

fn invalid(type_name: &str, reason: &str) -> RosError {
    RosError::InvalidDefinition {
        type_name: type_name.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_line(
    type_name: &str,
    package: Option<&str>,
    raw: &str,
) -> Result<Option<Declaration>, String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (type_token, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("expected 'type name', got {line:?}"))?;
    let rest = rest.trim_start();

    // A string constant keeps everything after '=' including '#'.
    let is_constant = match rest.find('=') {
        Some(eq) => rest.find('#').map_or(true, |hash| eq < hash),
        None => false,
    };

    if is_constant {
        return parse_constant(type_token, rest).map(Some);
    }

    let rest = strip_comment(rest).trim();
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return Err(format!("expected a single field name after {type_token:?}"));
    }
    validate_field_name(rest)?;

    let (base, cardinality) = split_array(type_token)?;
    let base_type = qualify(type_name, package, base)?;
    Ok(Some(Declaration::Field {
        base_type,
        type_token: type_token.to_string(),
        cardinality,
        name: rest.to_string(),
    }))
}

fn parse_constant(type_token: &str, rest: &str) -> Result<Declaration, String> {
    let primitive = PrimitiveType::from_token(type_token)
        .filter(|p| !matches!(p, PrimitiveType::Time | PrimitiveType::Duration))
        .ok_or_else(|| format!("constants must have a scalar or string type, got {type_token:?}"))?;
    let (name, value) = rest
        .split_once('=')
        .ok_or_else(|| "constant lacks '='".to_string())?;
    let name = name.trim();
    validate_field_name(name)?;

    let value = if primitive == PrimitiveType::String {
        value.trim().to_string()
    } else {
        strip_comment(value).trim().to_string()
    };
    check_constant_value(primitive, &value)?;

    Ok(Declaration::Constant {
        primitive,
        type_token: type_token.to_string(),
        name: name.to_string(),
        value,
    })
}

fn check_constant_value(primitive: PrimitiveType, value: &str) -> Result<(), String> {
    let ok = match primitive {
        PrimitiveType::Int8 => value.parse::<i8>().is_ok(),
        PrimitiveType::UInt8 => value.parse::<u8>().is_ok(),
        PrimitiveType::Int16 => value.parse::<i16>().is_ok(),
        PrimitiveType::UInt16 => value.parse::<u16>().is_ok(),
        PrimitiveType::Int32 => value.parse::<i32>().is_ok(),
        PrimitiveType::UInt32 => value.parse::<u32>().is_ok(),
        PrimitiveType::Int64 => value.parse::<i64>().is_ok(),
        PrimitiveType::UInt64 => value.parse::<u64>().is_ok(),
        PrimitiveType::Float32 | PrimitiveType::Float64 => value.parse::<f64>().is_ok(),
        PrimitiveType::Bool => matches!(value, "0" | "1" | "true" | "false" | "True" | "False"),
        PrimitiveType::String | PrimitiveType::Time | PrimitiveType::Duration => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{value:?} is not a valid {primitive:?} constant"))
    }
}

fn strip_comment(s: &str) -> &str {
    match s.find('#') {
        Some(idx) => &s[..idx],
        None => s,
    }
}

fn validate_field_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(format!("invalid field name {name:?}"))
    }
}

fn split_array(type_token: &str) -> Result<(&str, Cardinality), String> {
    let Some(open) = type_token.find('[') else {
        return Ok((type_token, Cardinality::Single));
    };
    let inner = type_token[open + 1..]
        .strip_suffix(']')
        .ok_or_else(|| format!("unterminated array suffix in {type_token:?}"))?;
    let cardinality = if inner.is_empty() {
        Cardinality::Variable
    } else {
        let n = inner
            .parse::<usize>()
            .map_err(|_| format!("invalid array length in {type_token:?}"))?;
        Cardinality::Fixed(n)
    };
    Ok((&type_token[..open], cardinality))
}

fn qualify(type_name: &str, package: Option<&str>, base: &str) -> Result<String, String> {
    if base.is_empty() {
        return Err("empty type".to_string());
    }
    if PrimitiveType::from_token(base).is_some() || base.contains('/') {
        return Ok(base.to_string());
    }
    if base == "Header" {
        return Ok(HEADER_TYPE.to_string());
    }
    match package {
        Some(pkg) => Ok(format!("{pkg}/{base}")),
        None => Err(format!(
            "cannot resolve {base:?}: {type_name:?} has no package"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(decl: &Declaration) -> (&str, &str, Cardinality) {
        match decl {
            Declaration::Field {
                base_type,
                name,
                cardinality,
                ..
            } => (base_type.as_str(), name.as_str(), *cardinality),
            other => panic!("expected field, got {other:?}"),
        }
    }

    #[test]
    fn test_fields_comments_and_blanks() {
        let decls = parse_definition(
            "geometry_msgs/Polygon",
            "# a polygon\n\nHeader header\nPoint32[] points  # vertices\nfloat64[3] extent\n",
        )
        .unwrap();
        assert_eq!(decls.len(), 3);
        assert_eq!(field(&decls[0]), ("std_msgs/Header", "header", Cardinality::Single));
        assert_eq!(
            field(&decls[1]),
            ("geometry_msgs/Point32", "points", Cardinality::Variable)
        );
        assert_eq!(field(&decls[2]), ("float64", "extent", Cardinality::Fixed(3)));
    }

    #[test]
    fn test_constants() {
        let decls = parse_definition(
            "test_ros/Constants",
            "int32 MAX=10 # upper bound\nstring GREETING= hello # world \nbyte FLAG=1",
        )
        .unwrap();
        assert_eq!(
            decls[0],
            Declaration::Constant {
                primitive: PrimitiveType::Int32,
                type_token: "int32".into(),
                name: "MAX".into(),
                value: "10".into(),
            }
        );
        match &decls[1] {
            Declaration::Constant { value, .. } => assert_eq!(value, "hello # world"),
            other => panic!("unexpected {other:?}"),
        }
        match &decls[2] {
            Declaration::Constant {
                primitive,
                type_token,
                ..
            } => {
                assert_eq!(*primitive, PrimitiveType::Int8);
                assert_eq!(type_token, "byte");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_lines() {
        assert!(parse_definition("a/B", "int32").is_err());
        assert!(parse_definition("a/B", "int32 9lives").is_err());
        assert!(parse_definition("a/B", "int32[x] data").is_err());
        assert!(parse_definition("a/B", "int32 x\nint64 x").is_err());
        assert!(parse_definition("a/B", "int8 TOO_BIG=300").is_err());
        assert!(parse_definition("NoPackage", "Other field").is_err());
    }

    #[test]
    fn test_split_service() {
        let (req, res) =
            split_service("test_ros/AddTwoInts", "int64 a\nint64 b\n---\nint64 sum").unwrap();
        assert_eq!(req, "int64 a\nint64 b");
        assert_eq!(res, "int64 sum");
        assert!(split_service("std_srvs/Empty", "---").is_ok());
        assert!(split_service("x/Y", "int64 a").is_err());
    }
}
