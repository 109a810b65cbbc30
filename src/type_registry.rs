use graphql_parser::Pos;
use graphql_parser::schema::{
    Definition, DirectiveDefinition, Document, Field, SchemaDefinition, TypeDefinition,
    TypeExtension, parse_schema,
};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use tracing::debug;

use crate::{GatewayError, OperationKind};

pub type SchemaType = TypeDefinition<'static, String>;
pub type SchemaField = Field<'static, String>;
pub type SchemaDirective = DirectiveDefinition<'static, String>;

pub const BUILT_IN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];
pub const BUILT_IN_DIRECTIVES: [&str; 5] =
    ["skip", "include", "deprecated", "specifiedBy", "oneOf"];

pub fn is_built_in_scalar(name: &str) -> bool {
    BUILT_IN_SCALARS.contains(&name)
}

pub fn is_built_in_directive(name: &str) -> bool {
    BUILT_IN_DIRECTIVES.contains(&name)
}

/// Name of a type definition regardless of its kind.
pub fn type_name(definition: &SchemaType) -> &str {
    match definition {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

/// The type system of one schema: named types, directive definitions and the
/// names of its root operation types. Types keep their declaration order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TypeRegistry {
    query_type: Option<String>,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
    types: IndexMap<String, SchemaType>,
    directives: IndexMap<String, SchemaDirective>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from SDL. Without a `schema` block the conventional
    /// `Query`, `Mutation` and `Subscription` names are used when declared.
    pub fn parse(sdl: &str) -> Result<Self, GatewayError> {
        let document = parse_schema::<String>(sdl)
            .map_err(|e| GatewayError::Parse(e.to_string()))?
            .into_static();

        let mut registry = TypeRegistry::new();
        let mut has_schema_definition = false;
        let mut extensions = Vec::new();

        for definition in document.definitions {
            match definition {
                Definition::SchemaDefinition(schema) => {
                    has_schema_definition = true;
                    registry.query_type = schema.query;
                    registry.mutation_type = schema.mutation;
                    registry.subscription_type = schema.subscription;
                }
                Definition::TypeDefinition(definition) => {
                    registry.insert_type(definition);
                }
                Definition::DirectiveDefinition(directive) => {
                    registry.insert_directive(directive);
                }
                Definition::TypeExtension(extension) => extensions.push(extension),
            }
        }

        for extension in extensions {
            registry.apply_extension(extension);
        }

        if !has_schema_definition {
            for kind in OperationKind::ALL {
                let conventional = conventional_root_name(kind);
                if registry.types.contains_key(conventional) {
                    registry.set_root_type_name(kind, conventional.to_string());
                }
            }
        }

        Ok(registry)
    }

    fn apply_extension(&mut self, extension: TypeExtension<'static, String>) {
        match extension {
            TypeExtension::Object(extension) => match self.types.get_mut(&extension.name) {
                Some(TypeDefinition::Object(object)) => {
                    for field in extension.fields {
                        if !object.fields.iter().any(|f| f.name == field.name) {
                            object.fields.push(field);
                        }
                    }
                    for interface in extension.implements_interfaces {
                        if !object.implements_interfaces.contains(&interface) {
                            object.implements_interfaces.push(interface);
                        }
                    }
                }
                _ => debug!(type_name = %extension.name, "ignoring extension of unknown object type"),
            },
            _ => debug!("ignoring non-object type extension"),
        }
    }

    pub fn root_type_name(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => self.query_type.as_deref(),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
    }

    pub fn set_root_type_name(&mut self, kind: OperationKind, name: String) {
        match kind {
            OperationKind::Query => self.query_type = Some(name),
            OperationKind::Mutation => self.mutation_type = Some(name),
            OperationKind::Subscription => self.subscription_type = Some(name),
        }
    }

    /// The root kind whose type is named `name`, if any.
    pub fn root_kind_of(&self, name: &str) -> Option<OperationKind> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| self.root_type_name(*kind) == Some(name))
    }

    pub fn get_type(&self, name: &str) -> Option<&SchemaType> {
        self.types.get(name)
    }

    pub fn get_type_mut(&mut self, name: &str) -> Option<&mut SchemaType> {
        self.types.get_mut(name)
    }

    pub fn contains_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Inserts a type unless one with the same name exists. Returns whether it was inserted.
    pub fn insert_type(&mut self, definition: SchemaType) -> bool {
        let name = type_name(&definition).to_string();
        if self.types.contains_key(&name) {
            return false;
        }
        self.types.insert(name, definition);
        true
    }

    pub fn types(&self) -> impl Iterator<Item = &SchemaType> {
        self.types.values()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn insert_directive(&mut self, directive: SchemaDirective) -> bool {
        if self.directives.contains_key(&directive.name) {
            return false;
        }
        self.directives.insert(directive.name.clone(), directive);
        true
    }

    pub fn directives(&self) -> impl Iterator<Item = &SchemaDirective> {
        self.directives.values()
    }

    pub fn scalar_names(&self) -> impl Iterator<Item = &str> {
        self.types.values().filter_map(|definition| match definition {
            TypeDefinition::Scalar(scalar) => Some(scalar.name.as_str()),
            _ => None,
        })
    }

    /// Fields of the root object type of the given kind.
    pub fn root_fields(&self, kind: OperationKind) -> &[SchemaField] {
        let object = self
            .root_type_name(kind)
            .and_then(|name| self.types.get(name));
        match object {
            Some(TypeDefinition::Object(object)) => &object.fields,
            _ => &[],
        }
    }

    pub fn root_field_names(&self, kind: OperationKind) -> BTreeSet<String> {
        self.root_fields(kind)
            .iter()
            .map(|field| field.name.clone())
            .collect()
    }

    pub fn to_document(&self) -> Document<'static, String> {
        let mut definitions = Vec::new();

        if self.query_type.is_some() || self.mutation_type.is_some() || self.subscription_type.is_some()
        {
            definitions.push(Definition::SchemaDefinition(SchemaDefinition {
                position: Pos::default(),
                directives: Vec::new(),
                query: self.query_type.clone(),
                mutation: self.mutation_type.clone(),
                subscription: self.subscription_type.clone(),
            }));
        }

        definitions.extend(
            self.directives
                .values()
                .filter(|directive| !is_built_in_directive(&directive.name))
                .cloned()
                .map(Definition::DirectiveDefinition),
        );
        definitions.extend(
            self.types
                .values()
                .filter(|definition| {
                    !matches!(definition, TypeDefinition::Scalar(s) if is_built_in_scalar(&s.name))
                })
                .cloned()
                .map(Definition::TypeDefinition),
        );

        Document { definitions }
    }

    pub fn to_sdl(&self) -> String {
        self.to_document().to_string()
    }
}

fn conventional_root_name(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Query => "Query",
        OperationKind::Mutation => "Mutation",
        OperationKind::Subscription => "Subscription",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn conventional_root_names_are_used_without_schema_block() {
        let registry = TypeRegistry::parse(
            r#"
            type Query { me: User }
            type Mutation { rename(name: String!): User }
            type User { id: ID! name: String }
            "#,
        )
        .unwrap();

        assert_eq!(registry.root_type_name(OperationKind::Query), Some("Query"));
        assert_eq!(registry.root_type_name(OperationKind::Mutation), Some("Mutation"));
        assert_eq!(registry.root_type_name(OperationKind::Subscription), None);
        assert_eq!(
            registry.root_field_names(OperationKind::Mutation),
            BTreeSet::from(["rename".to_string()])
        );
    }

    #[test]
    fn schema_block_overrides_root_names() {
        let registry = TypeRegistry::parse(
            r#"
            schema { query: RootQuery }
            type RootQuery { ping: String }
            type Query { unused: String }
            "#,
        )
        .unwrap();

        assert_eq!(registry.root_type_name(OperationKind::Query), Some("RootQuery"));
        assert_eq!(registry.root_kind_of("Query"), None);
    }

    #[test]
    fn object_extensions_add_fields() {
        let registry = TypeRegistry::parse(
            r#"
            type Query { a: String }
            extend type Query { b: String a: Int }
            "#,
        )
        .unwrap();

        let names: Vec<_> = registry
            .root_fields(OperationKind::Query)
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn printed_sdl_parses_back_to_the_same_registry() {
        let registry = TypeRegistry::parse(
            r#"
            directive @cached(ttl: Int = 60) on FIELD_DEFINITION
            scalar DateTime
            type Query { now: DateTime @cached }
            "#,
        )
        .unwrap();

        let reparsed = TypeRegistry::parse(&registry.to_sdl()).unwrap();
        assert_eq!(reparsed.type_names().collect::<Vec<_>>(), vec!["DateTime", "Query"]);
        assert_eq!(reparsed.directives().count(), 1);
        assert_eq!(reparsed.root_type_name(OperationKind::Query), Some("Query"));
    }

    #[test]
    fn invalid_sdl_is_a_parse_error() {
        let error = TypeRegistry::parse("type Query {").unwrap_err();
        assert!(matches!(error, GatewayError::Parse(_)));
    }
}
