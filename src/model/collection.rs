use super::schema::{Model, ModelSchema};

/// An explicit registry of models that share a schema lifecycle.
#[derive(Debug, Clone)]
pub struct ModelCollection {
    name: String,
    models: Vec<&'static ModelSchema>,
}

impl Default for ModelCollection {
    fn default() -> Self {
        Self::new("default")
    }
}

impl ModelCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            models: Vec::new(),
        }
    }

    /// Add `M`, ignoring duplicates.
    pub fn with<M: Model>(mut self) -> Self {
        self.register(M::schema());
        self
    }

    pub fn register(&mut self, schema: &'static ModelSchema) {
        if !self.contains(schema.name()) {
            self.models.push(schema);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn models(&self) -> &[&'static ModelSchema] {
        &self.models
    }

    pub fn get(&self, name: &str) -> Option<&'static ModelSchema> {
        self.models.iter().copied().find(|m| m.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{Post, User};

    #[test]
    fn test_registries_are_isolated() {
        let blog = ModelCollection::new("blog").with::<User>().with::<Post>();
        let users = ModelCollection::new("users").with::<User>();

        assert_eq!(blog.len(), 2);
        assert_eq!(users.len(), 1);
        assert!(!users.contains("Post"));
        assert_eq!(blog.name(), "blog");
    }

    #[test]
    fn test_duplicates_ignored() {
        let models = ModelCollection::default().with::<User>().with::<User>();
        assert_eq!(models.len(), 1);
        assert_eq!(models.get("User").map(|m| m.name()), Some("User"));
    }
}
