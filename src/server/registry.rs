//! Session registry.

use super::session::Session;
use crate::protocol::Category;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Authoritative map of session id to session, plus the category records.
pub struct SessionRegistry {
    sessions: BTreeMap<String, Session>,
    categories: BTreeMap<String, Category>,
    /// Ids handed out for sessions whose process is still being spawned.
    reserved: HashSet<String>,
    name_counter: HashMap<String, u32>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            categories: BTreeMap::new(),
            reserved: HashSet::new(),
            name_counter: HashMap::new(),
        }
    }

    /// Generate a unique id.
    pub fn generate_id(&mut self) -> String {
        let mut generator = names::Generator::default();
        loop {
            let base_name = generator.next().unwrap_or_else(|| "session".to_string());

            if !self.is_taken(&base_name) {
                return base_name;
            }

            // If used, append a counter
            let counter = self.name_counter.entry(base_name.clone()).or_insert(1);
            *counter += 1;
            let numbered_name = format!("{base_name}-{counter}");

            if !self.is_taken(&numbered_name) {
                return numbered_name;
            }
        }
    }

    fn is_taken(&self, id: &str) -> bool {
        self.sessions.contains_key(id) || self.reserved.contains(id)
    }

    /// Generate an id and hold it until [`add`](Self::add) or
    /// [`release`](Self::release).
    pub fn reserve_id(&mut self) -> String {
        let id = self.generate_id();
        self.reserved.insert(id.clone());
        id
    }

    pub fn release(&mut self, id: &str) {
        self.reserved.remove(id);
    }

    /// Generate a unique category id.
    pub fn generate_category_id(&mut self) -> String {
        loop {
            let id = format!("cat-{}", self.generate_id());
            if !self.categories.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn add(&mut self, session: Session) {
        self.reserved.remove(&session.id);
        self.sessions.insert(session.id.clone(), session);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Whether a session is already bound to `node_id`.
    #[must_use]
    pub fn node_in_use(&self, node_id: &str) -> bool {
        self.sessions.values().any(|s| s.node_id == node_id)
    }

    pub fn find_by_node_mut(&mut self, node_id: &str) -> Option<&mut Session> {
        self.sessions.values_mut().find(|s| s.node_id == node_id)
    }

    /// All sessions, ordered by id.
    pub fn list(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn list_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub const fn categories(&self) -> &BTreeMap<String, Category> {
        &self.categories
    }

    pub fn category_mut(&mut self, id: &str) -> Option<&mut Category> {
        self.categories.get_mut(id)
    }

    pub fn insert_category(&mut self, category: Category) {
        self.categories.insert(category.id.clone(), category);
    }

    /// Remove a category and clear it from its member sessions.
    pub fn remove_category(&mut self, id: &str) -> Option<Category> {
        let removed = self.categories.remove(id)?;
        for session in self.sessions.values_mut() {
            if session.annotations.category_id.as_deref() == Some(id) {
                session.annotations.category_id = None;
            }
        }
        Some(removed)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::PersistedNode;
    use crate::server::output::OutputBuffer;
    use crate::status::ClassifierConfig;
    use std::path::PathBuf;

    fn placeholder(id: &str, category: Option<&str>) -> Session {
        let node = PersistedNode {
            session_id: id.into(),
            node_id: format!("node-{id}"),
            agent_kind: "shell".into(),
            label: id.into(),
            command: None,
            cwd: PathBuf::from("/tmp"),
            branch: None,
            created_at: 0,
            custom_name: None,
            custom_color: None,
            notes: None,
            category_id: category.map(Into::into),
            position: None,
        };
        Session::restored(node, OutputBuffer::default(), (24, 80), ClassifierConfig::default())
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let mut registry = SessionRegistry::new();

        // Generate many IDs and verify they're all unique
        let mut ids = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = registry.generate_id();
            assert!(ids.insert(id.clone()), "Generated duplicate ID: {id}");
            registry.add(placeholder(&id, None));
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_generate_id_format() {
        let mut registry = SessionRegistry::new();
        let id = registry.generate_id();

        // Should be adjective-noun format (contains a hyphen)
        assert!(id.contains('-'), "ID should be adjective-noun format: {id}");

        // Should be lowercase
        assert_eq!(id, id.to_lowercase(), "ID should be lowercase: {id}");
    }

    #[test]
    fn test_reserved_ids_are_not_reissued() {
        let mut registry = SessionRegistry::new();
        let ids: std::collections::HashSet<String> = (0..50).map(|_| registry.reserve_id()).collect();
        assert_eq!(ids.len(), 50);

        let first = ids.iter().next().unwrap().clone();
        registry.add(placeholder(&first, None));
        assert!(registry.contains(&first));
        registry.release("never-reserved");
    }

    #[test]
    fn test_category_ids() {
        let mut registry = SessionRegistry::new();
        let id = registry.generate_category_id();
        assert!(id.starts_with("cat-"));
    }

    #[test]
    fn test_node_lookup() {
        let mut registry = SessionRegistry::new();
        registry.add(placeholder("a", None));
        assert!(registry.node_in_use("node-a"));
        assert!(!registry.node_in_use("node-b"));
        assert_eq!(registry.find_by_node_mut("node-a").map(|s| s.id.clone()), Some("a".into()));
    }

    #[test]
    fn test_remove_category_clears_members() {
        let mut registry = SessionRegistry::new();
        registry.insert_category(Category {
            id: "c1".into(),
            name: "Backend".into(),
            color: None,
            position: None,
        });
        registry.add(placeholder("a", Some("c1")));
        registry.add(placeholder("b", Some("other")));

        assert!(registry.remove_category("c1").is_some());
        assert_eq!(registry.get("a").unwrap().annotations.category_id, None);
        assert_eq!(registry.get("b").unwrap().annotations.category_id.as_deref(), Some("other"));
        assert!(registry.remove_category("c1").is_none());
    }
}
