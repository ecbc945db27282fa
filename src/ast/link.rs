use std::fmt;

/// Placeholder index name meaning "whichever index owns the left field"
pub const THIS_INDEX: &str = "this.index";

/// Identity of an [`IndexLink`] inside a [`LinkTable`].
///
/// Two links with identical fields are still distinct unless they share a
/// `LinkId`; ownership grouping and expansion merging compare ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u32);

/// Declared relationship `left_field = <index_name> right_field`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLink {
    /// Alias the link was declared under in `#options`
    pub name: Option<String>,
    /// Join field on the left side, optionally qualified by another link's alias
    pub left_field: String,
    pub index_name: String,
    /// Join field on `index_name`
    pub right_field: String,
}

impl IndexLink {
    pub fn new(
        name: Option<String>,
        left_field: impl Into<String>,
        index_name: impl Into<String>,
        right_field: impl Into<String>,
    ) -> Self {
        Self {
            name,
            left_field: left_field.into(),
            index_name: index_name.into(),
            right_field: right_field.into(),
        }
    }

    /// Link targets the `this.index` placeholder
    pub fn is_this_index(&self) -> bool {
        self.index_name == THIS_INDEX
    }

    /// Split `alias.field` left fields into their alias and bare field
    pub fn left_parts(&self) -> (Option<&str>, &str) {
        match self.left_field.split_once('.') {
            Some((alias, field)) => (Some(alias), field),
            None => (None, &self.left_field),
        }
    }
}

impl fmt::Display for IndexLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{}:", name)?;
        }
        write!(
            f,
            "({}=<{}>{})",
            self.left_field, self.index_name, self.right_field
        )
    }
}

/// All links known to one query, in declaration order
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    links: Vec<IndexLink>,
    declared: Vec<LinkId>,
    own: Option<LinkId>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a link without declaring it (e.g. from `#expand<...>`)
    pub fn add(&mut self, link: IndexLink) -> LinkId {
        let id = LinkId(self.links.len() as u32);
        self.links.push(link);
        id
    }

    /// Store a link declared in `#options`
    pub fn declare(&mut self, link: IndexLink) -> LinkId {
        let id = self.add(link);
        self.declared.push(id);
        id
    }

    /// Install the link for the index the query is issued against
    pub fn set_own(&mut self, index_name: &str, primary_key: &str) -> LinkId {
        let id = self.add(IndexLink::new(None, primary_key, index_name, primary_key));
        self.own = Some(id);
        id
    }

    /// Link of the index the query is issued against
    ///
    /// # Panics
    ///
    /// Panics if called before [`LinkTable::set_own`].
    pub fn own(&self) -> LinkId {
        self.own.expect("own index link is installed before optimization")
    }

    pub fn has_own(&self) -> bool {
        self.own.is_some()
    }

    pub fn get(&self, id: LinkId) -> &IndexLink {
        &self.links[id.0 as usize]
    }

    pub fn replace(&mut self, id: LinkId, link: IndexLink) {
        self.links[id.0 as usize] = link;
    }

    /// Every stored link, declared or not
    pub fn ids(&self) -> Vec<LinkId> {
        (0..self.links.len() as u32).map(LinkId).collect()
    }

    /// First link in search order pointing at `index_name`
    pub fn for_index(&self, index_name: &str) -> Option<LinkId> {
        self.search_order()
            .into_iter()
            .find(|&id| self.get(id).index_name == index_name)
    }

    pub fn declared(&self) -> &[LinkId] {
        &self.declared
    }

    /// Own link first, then declared links in declaration order
    pub fn search_order(&self) -> Vec<LinkId> {
        self.own.into_iter().chain(self.declared.iter().copied()).collect()
    }

    /// Find a declared link by alias, falling back to index name
    pub fn by_name(&self, name: &str) -> Option<LinkId> {
        self.declared
            .iter()
            .copied()
            .find(|&id| self.get(id).name.as_deref() == Some(name))
            .or_else(|| {
                self.search_order()
                    .into_iter()
                    .find(|&id| self.get(id).index_name == name)
            })
    }

    /// Index on the left side of a link: the aliased link's index, or the own index
    pub fn left_index(&self, id: LinkId) -> &str {
        let link = self.get(id);
        if let (Some(alias), _) = link.left_parts() {
            if let Some(other) = self.by_alias(alias) {
                if other != id {
                    return &self.get(other).index_name;
                }
            }
        }
        &self.get(self.own()).index_name
    }

    /// Index on the left side of a link used inside a query on `enclosing`.
    ///
    /// Declared links and alias-qualified left fields name their index. An
    /// unqualified `#expand` link joins from the index it appears in.
    pub fn left_index_from<'s>(&'s self, id: LinkId, enclosing: &'s str) -> &'s str {
        if self.has_fixed_left_index(id) {
            self.left_index(id)
        } else {
            enclosing
        }
    }

    /// Declared, or left field qualified by another link's alias
    pub fn has_fixed_left_index(&self, id: LinkId) -> bool {
        self.declared.contains(&id)
            || matches!(
                self.get(id).left_parts(),
                (Some(alias), _) if self.by_alias(alias).is_some_and(|other| other != id)
            )
    }

    /// Bare left join field, with any alias qualifier removed
    pub fn left_field(&self, id: LinkId) -> &str {
        let link = self.get(id);
        match link.left_parts() {
            (Some(alias), field) if self.by_alias(alias).is_some() => field,
            _ => &link.left_field,
        }
    }

    fn by_alias(&self, alias: &str) -> Option<LinkId> {
        self.declared
            .iter()
            .copied()
            .find(|&id| self.get(id).name.as_deref() == Some(alias))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
