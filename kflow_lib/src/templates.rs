use std::sync::Arc;

use dashmap::DashMap;

use crate::fields::*;

/// Templates are scoped to the exporter and its observation domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    pub exporter: u32,
    pub domain_id: u64,
    pub template_id: u16,
}

impl TemplateKey {
    pub fn new(exporter: u32, domain_id: u64, template_id: u16) -> Self {
        TemplateKey {
            exporter,
            domain_id,
            template_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateField {
    /// Element id with the enterprise bit cleared.
    pub id: u16,
    pub length: u16,
    pub enterprise_number: Option<u32>,
}

impl TemplateField {
    pub fn new(id: u16, length: u16, enterprise_number: Option<u32>) -> Self {
        TemplateField {
            id,
            length,
            enterprise_number,
        }
    }

    pub fn flow_field(&self) -> FlowField {
        FlowField::from_specifier(self.id, self.enterprise_number)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    fields: Vec<TemplateField>,
    //only nonzero for options templates; scope fields are decoded like any other field
    scope_field_count: u16,
    length: usize,
}

impl Template {
    pub fn new(fields: Vec<TemplateField>, scope_field_count: u16) -> Self {
        let length = fields.iter().map(|f| usize::from(f.length)).sum();
        Template {
            fields,
            scope_field_count,
            length,
        }
    }

    pub fn fields(&self) -> &[TemplateField] {
        &self.fields
    }

    pub fn scope_field_count(&self) -> u16 {
        self.scope_field_count
    }

    /// Byte length of one data record described by this template.
    pub fn length(&self) -> usize {
        self.length
    }
}

/// Template schemas shared by all server workers. A redefinition replaces the
/// previous template for the key, last writer wins.
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: DashMap<TemplateKey, Arc<Template>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: TemplateKey, template: Template) {
        self.templates.insert(key, Arc::new(template));
    }

    pub fn get(&self, key: &TemplateKey) -> Option<Arc<Template>> {
        self.templates.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
