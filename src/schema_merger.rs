use graphql_parser::schema::TypeDefinition;
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::schema_source::{SchemaSource, SourceSchema};
use crate::type_registry::{SchemaType, TypeRegistry, is_built_in_scalar, type_name};
use crate::{GatewayError, OperationKind};

/// The union of every loaded source's type system.
#[derive(Clone, Debug, Default)]
pub struct MergedSchema {
    pub registry: TypeRegistry,
    /// Which source resolves each root field.
    pub bindings: IndexMap<(OperationKind, String), Arc<SchemaSource>>,
    /// Custom scalars declared by any source.
    pub scalars: BTreeSet<String>,
}

impl MergedSchema {
    pub fn binding(&self, kind: OperationKind, field: &str) -> Option<&Arc<SchemaSource>> {
        self.bindings.get(&(kind, field.to_string()))
    }
}

/// Folds source schemas into one, in the order given. Earlier sources win on
/// every name clash except root type names, which must agree.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchemaMerger;

impl SchemaMerger {
    pub fn new() -> Self {
        SchemaMerger
    }

    pub fn merge(&self, sources: &[SourceSchema]) -> Result<MergedSchema, GatewayError> {
        let mut merged = MergedSchema::default();

        for source in sources {
            self.merge_source(&mut merged, source)?;
        }

        info!(
            sources = sources.len(),
            types = merged.registry.len(),
            root_fields = merged.bindings.len(),
            "merged source schemas"
        );
        Ok(merged)
    }

    fn merge_source(
        &self,
        merged: &mut MergedSchema,
        source: &SourceSchema,
    ) -> Result<(), GatewayError> {
        let source_name = source.name.as_str();
        let target = &mut merged.registry;
        let registry = &source.registry;

        for kind in OperationKind::ALL {
            let Some(incoming) = registry.root_type_name(kind) else {
                continue;
            };
            match target.root_type_name(kind) {
                None => target.set_root_type_name(kind, incoming.to_string()),
                Some(existing) if existing == incoming => {}
                Some(existing) => {
                    return Err(GatewayError::MergeConflict {
                        kind,
                        existing: existing.to_string(),
                        incoming: incoming.to_string(),
                        source_name: source_name.to_string(),
                    });
                }
            }
        }

        for definition in registry.types() {
            let name = type_name(definition);
            if let Some(kind) = target.root_kind_of(name) {
                if registry.root_type_name(kind) == Some(name) {
                    merge_root_fields(target, definition, name);
                    continue;
                }
            }
            if !target.insert_type(definition.clone()) {
                debug!(type_name = name, source = source_name, "keeping earlier definition of type");
            }
        }

        for directive in registry.directives() {
            target.insert_directive(directive.clone());
        }

        merged.scalars.extend(
            registry
                .scalar_names()
                .filter(|name| !is_built_in_scalar(name))
                .map(str::to_string),
        );

        for binding in &source.bindings {
            merged
                .bindings
                .entry((binding.kind, binding.field.clone()))
                .or_insert_with(|| Arc::clone(&binding.source));
        }

        Ok(())
    }
}

/// Appends the fields of an incoming root type that the target lacks.
fn merge_root_fields(target: &mut TypeRegistry, incoming: &SchemaType, name: &str) {
    let TypeDefinition::Object(incoming) = incoming else {
        return;
    };

    match target.get_type_mut(name) {
        Some(TypeDefinition::Object(existing)) => {
            for field in &incoming.fields {
                if !existing.fields.iter().any(|f| f.name == field.name) {
                    existing.fields.push(field.clone());
                }
            }
        }
        Some(_) => debug!(type_name = name, "root type name is used by a non-object type"),
        None => {
            target.insert_type(TypeDefinition::Object(incoming.clone()));
        }
    }
}
