use graphql_parser::Pos;
use graphql_parser::schema::{
    Directive, DirectiveDefinition, DirectiveLocation, EnumType, EnumValue, Field,
    InputObjectType, InputValue, InterfaceType, ObjectType, ScalarType, Type, TypeDefinition,
    UnionType, Value, parse_schema,
};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::schema_source::{RootBinding, SchemaSource};
use crate::type_registry::{TypeRegistry, is_built_in_directive, is_built_in_scalar};
use crate::{GatewayError, OperationKind};

/// The standard introspection query sent to remote sources.
pub const INTROSPECTION_QUERY: &str = r#"
query IntrospectionQuery {
  __schema {
    queryType { name }
    mutationType { name }
    subscriptionType { name }
    types { ...FullType }
    directives {
      name
      description
      locations
      args { ...InputValue }
    }
  }
}

fragment FullType on __Type {
  kind
  name
  description
  fields(includeDeprecated: true) {
    name
    description
    args { ...InputValue }
    type { ...TypeRef }
    isDeprecated
    deprecationReason
  }
  inputFields { ...InputValue }
  interfaces { ...TypeRef }
  enumValues(includeDeprecated: true) {
    name
    description
    isDeprecated
    deprecationReason
  }
  possibleTypes { ...TypeRef }
}

fragment InputValue on __InputValue {
  name
  description
  type { ...TypeRef }
  defaultValue
}

fragment TypeRef on __Type {
  kind
  name
  ofType {
    kind
    name
    ofType {
      kind
      name
      ofType {
        kind
        name
        ofType {
          kind
          name
          ofType {
            kind
            name
            ofType {
              kind
              name
              ofType {
                kind
                name
              }
            }
          }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    data: Option<IntrospectionData>,
    #[serde(default)]
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct IntrospectionData {
    #[serde(rename = "__schema")]
    schema: Option<IntrospectionSchema>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionSchema {
    query_type: Option<NamedRef>,
    mutation_type: Option<NamedRef>,
    subscription_type: Option<NamedRef>,
    types: Vec<FullType>,
    #[serde(default)]
    directives: Vec<IntrospectionDirective>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
    List,
    NonNull,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullType {
    kind: TypeKind,
    name: String,
    description: Option<String>,
    fields: Option<Vec<IntrospectionField>>,
    input_fields: Option<Vec<IntrospectionInputValue>>,
    interfaces: Option<Vec<TypeRef>>,
    enum_values: Option<Vec<IntrospectionEnumValue>>,
    possible_types: Option<Vec<TypeRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionField {
    name: String,
    description: Option<String>,
    #[serde(default)]
    args: Vec<IntrospectionInputValue>,
    #[serde(rename = "type")]
    field_type: TypeRef,
    #[serde(default)]
    is_deprecated: bool,
    deprecation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionInputValue {
    name: String,
    description: Option<String>,
    #[serde(rename = "type")]
    value_type: TypeRef,
    default_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionEnumValue {
    name: String,
    description: Option<String>,
    #[serde(default)]
    is_deprecated: bool,
    deprecation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionDirective {
    name: String,
    description: Option<String>,
    #[serde(default)]
    locations: Vec<String>,
    #[serde(default)]
    args: Vec<IntrospectionInputValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeRef {
    kind: TypeKind,
    name: Option<String>,
    of_type: Option<Box<TypeRef>>,
}

/// Converts a raw introspection response into a type registry.
pub fn registry_from_introspection(raw: &str) -> Result<TypeRegistry, GatewayError> {
    let response: IntrospectionResponse =
        serde_json::from_str(raw).map_err(|e| GatewayError::Introspection(e.to_string()))?;

    let schema = match response.data.and_then(|data| data.schema) {
        Some(schema) => schema,
        None => {
            let detail = response
                .errors
                .filter(|errors| !errors.is_empty())
                .map(|errors| serde_json::Value::Array(errors).to_string())
                .unwrap_or_else(|| "missing data section".to_string());
            return Err(GatewayError::Introspection(detail));
        }
    };

    let mut registry = TypeRegistry::new();
    if let Some(query) = schema.query_type {
        registry.set_root_type_name(OperationKind::Query, query.name);
    }
    if let Some(mutation) = schema.mutation_type {
        registry.set_root_type_name(OperationKind::Mutation, mutation.name);
    }
    if let Some(subscription) = schema.subscription_type {
        registry.set_root_type_name(OperationKind::Subscription, subscription.name);
    }

    for full_type in schema.types {
        if full_type.name.starts_with("__") {
            continue;
        }
        if full_type.kind == TypeKind::Scalar && is_built_in_scalar(&full_type.name) {
            continue;
        }
        registry.insert_type(convert_type(full_type)?);
    }

    for directive in schema.directives {
        if is_built_in_directive(&directive.name) {
            continue;
        }
        registry.insert_directive(convert_directive(directive)?);
    }

    Ok(registry)
}

/// One binding per root field of the source, each delegating to `source`.
pub fn root_bindings(source: &Arc<SchemaSource>, registry: &TypeRegistry) -> Vec<RootBinding> {
    OperationKind::ALL
        .into_iter()
        .flat_map(|kind| {
            registry.root_fields(kind).iter().map(move |field| RootBinding {
                kind,
                field: field.name.clone(),
                source: Arc::clone(source),
            })
        })
        .collect()
}

fn convert_type(full_type: FullType) -> Result<TypeDefinition<'static, String>, GatewayError> {
    let position = Pos::default();
    let definition = match full_type.kind {
        TypeKind::Scalar => TypeDefinition::Scalar(ScalarType {
            position,
            description: full_type.description,
            name: full_type.name,
            directives: Vec::new(),
        }),
        TypeKind::Object => TypeDefinition::Object(ObjectType {
            position,
            description: full_type.description,
            name: full_type.name,
            implements_interfaces: named_refs(full_type.interfaces),
            directives: Vec::new(),
            fields: convert_fields(full_type.fields)?,
        }),
        TypeKind::Interface => TypeDefinition::Interface(InterfaceType {
            position,
            description: full_type.description,
            name: full_type.name,
            implements_interfaces: named_refs(full_type.interfaces),
            directives: Vec::new(),
            fields: convert_fields(full_type.fields)?,
        }),
        TypeKind::Union => TypeDefinition::Union(UnionType {
            position,
            description: full_type.description,
            name: full_type.name,
            directives: Vec::new(),
            types: named_refs(full_type.possible_types),
        }),
        TypeKind::Enum => TypeDefinition::Enum(EnumType {
            position,
            description: full_type.description,
            name: full_type.name,
            directives: Vec::new(),
            values: full_type
                .enum_values
                .unwrap_or_default()
                .into_iter()
                .map(|value| EnumValue {
                    position,
                    description: value.description,
                    name: value.name,
                    directives: deprecation(value.is_deprecated, value.deprecation_reason),
                })
                .collect(),
        }),
        TypeKind::InputObject => TypeDefinition::InputObject(InputObjectType {
            position,
            description: full_type.description,
            name: full_type.name,
            directives: Vec::new(),
            fields: convert_input_values(full_type.input_fields.unwrap_or_default())?,
        }),
        TypeKind::List | TypeKind::NonNull => {
            return Err(GatewayError::Introspection(format!(
                "wrapping type {} listed as a named type",
                full_type.name
            )));
        }
    };
    Ok(definition)
}

fn convert_fields(
    fields: Option<Vec<IntrospectionField>>,
) -> Result<Vec<Field<'static, String>>, GatewayError> {
    fields
        .unwrap_or_default()
        .into_iter()
        .map(|field| {
            Ok(Field {
                position: Pos::default(),
                description: field.description,
                name: field.name,
                arguments: convert_input_values(field.args)?,
                field_type: convert_type_ref(&field.field_type)?,
                directives: deprecation(field.is_deprecated, field.deprecation_reason),
            })
        })
        .collect()
}

fn convert_input_values(
    values: Vec<IntrospectionInputValue>,
) -> Result<Vec<InputValue<'static, String>>, GatewayError> {
    values
        .into_iter()
        .map(|value| {
            let default_value = match value.default_value {
                Some(literal) => Some(parse_default_value(&literal)?),
                None => None,
            };
            Ok(InputValue {
                position: Pos::default(),
                description: value.description,
                name: value.name,
                value_type: convert_type_ref(&value.value_type)?,
                default_value,
                directives: Vec::new(),
            })
        })
        .collect()
}

fn convert_directive(
    directive: IntrospectionDirective,
) -> Result<DirectiveDefinition<'static, String>, GatewayError> {
    let locations = directive
        .locations
        .iter()
        .filter_map(|location| match DirectiveLocation::from_str(location) {
            Ok(location) => Some(location),
            Err(_) => {
                debug!(directive = %directive.name, %location, "skipping unknown directive location");
                None
            }
        })
        .collect();

    Ok(DirectiveDefinition {
        position: Pos::default(),
        description: directive.description,
        name: directive.name,
        arguments: convert_input_values(directive.args)?,
        repeatable: false,
        locations,
    })
}

fn convert_type_ref(type_ref: &TypeRef) -> Result<Type<'static, String>, GatewayError> {
    match type_ref.kind {
        TypeKind::NonNull => {
            let inner = inner_type_ref(type_ref)?;
            Ok(Type::NonNullType(Box::new(convert_type_ref(inner)?)))
        }
        TypeKind::List => {
            let inner = inner_type_ref(type_ref)?;
            Ok(Type::ListType(Box::new(convert_type_ref(inner)?)))
        }
        _ => type_ref
            .name
            .clone()
            .map(Type::NamedType)
            .ok_or_else(|| GatewayError::Introspection("named type reference without a name".into())),
    }
}

fn inner_type_ref(type_ref: &TypeRef) -> Result<&TypeRef, GatewayError> {
    type_ref
        .of_type
        .as_deref()
        .ok_or_else(|| GatewayError::Introspection("wrapping type reference without ofType".into()))
}

fn named_refs(refs: Option<Vec<TypeRef>>) -> Vec<String> {
    refs.unwrap_or_default()
        .into_iter()
        .filter_map(|r| r.name)
        .collect()
}

fn deprecation(is_deprecated: bool, reason: Option<String>) -> Vec<Directive<'static, String>> {
    if !is_deprecated {
        return Vec::new();
    }
    let arguments = reason
        .map(|reason| vec![("reason".to_string(), Value::String(reason))])
        .unwrap_or_default();
    vec![Directive {
        position: Pos::default(),
        name: "deprecated".to_string(),
        arguments,
    }]
}

/// Default values arrive as GraphQL literals; parse one through a throwaway input type.
fn parse_default_value(literal: &str) -> Result<Value<'static, String>, GatewayError> {
    let sdl = format!("input DefaultValueHolder {{ value: String = {} }}", literal);
    let document = parse_schema::<String>(&sdl)
        .map_err(|e| GatewayError::Introspection(format!("invalid default value {literal}: {e}")))?
        .into_static();

    document
        .definitions
        .into_iter()
        .find_map(|definition| match definition {
            graphql_parser::schema::Definition::TypeDefinition(TypeDefinition::InputObject(
                input,
            )) => input.fields.into_iter().next().and_then(|f| f.default_value),
            _ => None,
        })
        .ok_or_else(|| GatewayError::Introspection(format!("invalid default value {literal}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn introspection(types: serde_json::Value) -> String {
        json!({
            "data": {
                "__schema": {
                    "queryType": {"name": "Query"},
                    "mutationType": null,
                    "subscriptionType": null,
                    "types": types,
                    "directives": [
                        {"name": "include", "description": null, "locations": ["FIELD"], "args": []},
                        {"name": "auth", "description": null, "locations": ["FIELD_DEFINITION", "NOT_A_LOCATION"], "args": []}
                    ]
                }
            }
        })
        .to_string()
    }

    #[test]
    fn converts_objects_fields_and_arguments() {
        let raw = introspection(json!([
            {"kind": "SCALAR", "name": "String", "description": null},
            {"kind": "OBJECT", "name": "__Schema", "fields": []},
            {
                "kind": "OBJECT", "name": "Query", "description": "Entry points",
                "fields": [{
                    "name": "users",
                    "description": null,
                    "args": [{
                        "name": "first",
                        "description": null,
                        "type": {"kind": "SCALAR", "name": "Int", "ofType": null},
                        "defaultValue": "10"
                    }],
                    "type": {"kind": "NON_NULL", "name": null, "ofType": {
                        "kind": "LIST", "name": null, "ofType": {"kind": "OBJECT", "name": "User", "ofType": null}
                    }},
                    "isDeprecated": true,
                    "deprecationReason": "use people"
                }],
                "interfaces": []
            },
            {"kind": "OBJECT", "name": "User", "fields": [{
                "name": "id", "args": [],
                "type": {"kind": "SCALAR", "name": "ID", "ofType": null}
            }], "interfaces": []},
            {"kind": "ENUM", "name": "Role", "enumValues": [{"name": "ADMIN"}, {"name": "USER"}]},
            {"kind": "SCALAR", "name": "DateTime"}
        ]));

        let registry = registry_from_introspection(&raw).unwrap();
        assert_eq!(
            registry.type_names().collect::<Vec<_>>(),
            vec!["Query", "User", "Role", "DateTime"]
        );
        assert_eq!(registry.directives().count(), 1);

        let users = &registry.root_fields(OperationKind::Query)[0];
        assert_eq!(users.field_type.to_string(), "[User]!");
        assert_eq!(users.arguments[0].default_value, Some(Value::Int(10.into())));
        assert_eq!(users.directives[0].name, "deprecated");

        let sdl = registry.to_sdl();
        assert!(sdl.contains("users(first: Int = 10): [User]!"), "{sdl}");
    }

    #[test]
    fn missing_data_is_an_error() {
        let raw = json!({"errors": [{"message": "introspection disabled"}]}).to_string();
        let error = registry_from_introspection(&raw).unwrap_err();
        assert!(error.to_string().contains("introspection disabled"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(registry_from_introspection("<html>").is_err());
    }

    #[test]
    fn parses_complex_default_values() {
        let value = parse_default_value(r#"{limit: 5, tags: ["a", "b"], order: ASC}"#).unwrap();
        assert!(matches!(value, Value::Object(_)));
    }
}
