//! Per-kind request handlers.
//!
//! A handler reads the request and the local catalog, works out which
//! source regions the request touches, and returns the region-scoped tasks
//! plus what the aggregator must do once every region succeeded.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use regionsync_core::{RegionId, region_key};
use regionsync_state::{LifecycleRequest, RequestKind, RequestPayload, StateStore, TableMetadata};
use regionsync_xlate::RegionIdMapping;

use crate::aggregator::Completion;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableAction {
    /// Start streaming the tables from the region.
    Add,
    /// Stop streaming the tables from the region.
    Remove,
    /// Apply a schema change to tables already streaming.
    Evolve,
}

/// Work for one source region's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTask {
    pub region: String,
    pub action: TableAction,
    pub tables: Vec<TableMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    Tables(Vec<RegionTask>),
    AddRegion(String),
    RemoveRegion(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub kind: RequestKind,
    pub work: Work,
    pub completion: Completion,
}

impl Plan {
    /// Regions the aggregator waits for.
    pub fn expected_regions(&self) -> BTreeSet<String> {
        match &self.work {
            Work::Tables(tasks) => tasks.iter().map(|t| t.region.clone()).collect(),
            Work::AddRegion(region) | Work::RemoveRegion(region) => BTreeSet::from([region.clone()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Planned {
    Work(Plan),
    /// The request cannot be carried out; post this failure reason.
    Rejected(String),
    Shutdown,
}

/// Expand `request` against the local catalog.
///
/// `sources` maps each configured source region's key to its name.
pub fn plan_request(
    request: &LifecycleRequest,
    store: &StateStore,
    local: &RegionIdMapping,
    sources: &BTreeMap<String, String>,
) -> EngineResult<Planned> {
    let kind = request.kind();
    let planner = Planner {
        request,
        store,
        local,
        sources,
    };
    let planned = match &request.payload {
        RequestPayload::CreateTable { table } => planner.create(kind, table.clone())?,
        RequestPayload::CreateChildTable { table } => planner.create_child(table)?,
        RequestPayload::UpdateTable { table } => planner.update(table)?,
        RequestPayload::DropTable { table } => planner.drop_table(table)?,
        RequestPayload::DropChildTable { table } => planner.drop_child(table)?,
        RequestPayload::AddRegion { region } => planner.add_region(region)?,
        RequestPayload::RemoveRegion { region } => planner.remove_region(region),
        RequestPayload::Shutdown => Planned::Shutdown,
    };
    debug!(request_id = request.id, %kind, ?planned, "request planned");
    Ok(planned)
}

struct Planner<'a> {
    request: &'a LifecycleRequest,
    store: &'a StateStore,
    local: &'a RegionIdMapping,
    sources: &'a BTreeMap<String, String>,
}

impl Planner<'_> {
    /// Configured name of every region in `ids`.
    fn region_names(&self, ids: &BTreeSet<RegionId>) -> EngineResult<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for id in ids {
            let Some(name) = self.local.name_for(*id)? else {
                return Err(EngineError::UnknownRegion {
                    request_id: self.request.id,
                    region: format!("id {id}"),
                });
            };
            let Some(configured) = self.sources.get(&region_key(&name)) else {
                return Err(EngineError::UnknownRegion {
                    request_id: self.request.id,
                    region: name,
                });
            };
            names.insert(configured.clone());
        }
        Ok(names)
    }

    fn tasks(
        regions: impl IntoIterator<Item = String>,
        action: TableAction,
        tables: &[TableMetadata],
    ) -> Vec<RegionTask> {
        regions
            .into_iter()
            .map(|region| RegionTask {
                region,
                action,
                tables: tables.to_vec(),
            })
            .collect()
    }

    fn create(&self, kind: RequestKind, table: TableMetadata) -> EngineResult<Planned> {
        let regions = self.region_names(&table.regions)?;
        Ok(Planned::Work(Plan {
            kind,
            work: Work::Tables(Self::tasks(regions, TableAction::Add, std::slice::from_ref(&table))),
            completion: Completion::UpsertTable {
                table,
                removed_sources: Vec::new(),
            },
        }))
    }

    fn create_child(&self, table: &TableMetadata) -> EngineResult<Planned> {
        let Some(parent_name) = table.parent.as_deref() else {
            return Ok(Planned::Rejected(format!("table {} has no parent", table.name)));
        };
        let Some(parent) = self.store.get_table(parent_name)? else {
            return Ok(Planned::Rejected(format!(
                "parent table {parent_name} of {} does not exist",
                table.name
            )));
        };
        let mut child = table.clone();
        if child.regions.is_empty() {
            child.regions = parent.regions.clone();
        }
        self.create(RequestKind::CreateChildTable, child)
    }

    fn update(&self, table: &TableMetadata) -> EngineResult<Planned> {
        let Some(current) = self.store.get_table(&table.name)? else {
            return self.create(RequestKind::UpdateTable, table.clone());
        };

        let before = self.region_names(&current.regions)?;
        let after = self.region_names(&table.regions)?;
        let removed: Vec<String> = before.difference(&after).cloned().collect();
        let added: Vec<String> = after.difference(&before).cloned().collect();

        let mut tasks = Self::tasks(removed.clone(), TableAction::Remove, std::slice::from_ref(&current));
        tasks.extend(Self::tasks(added, TableAction::Add, std::slice::from_ref(table)));
        if table.schema_version != current.schema_version {
            let kept = before.intersection(&after).cloned();
            tasks.extend(Self::tasks(kept, TableAction::Evolve, std::slice::from_ref(table)));
        }

        Ok(Planned::Work(Plan {
            kind: RequestKind::UpdateTable,
            work: Work::Tables(tasks),
            completion: Completion::UpsertTable {
                table: table.clone(),
                removed_sources: removed,
            },
        }))
    }

    fn drop_table(&self, table: &TableMetadata) -> EngineResult<Planned> {
        let root = self.store.get_table(&table.name)?.unwrap_or_else(|| table.clone());
        let mut affected = vec![root.clone()];
        affected.extend(
            self.store
                .list_tables()?
                .into_iter()
                .filter(|t| t.parent.as_deref() == Some(root.name.as_str())),
        );

        let mut ids = BTreeSet::new();
        for t in &affected {
            ids.extend(t.regions.iter().copied());
        }
        let regions = self.region_names(&ids)?;
        let names = affected.iter().map(|t| t.name.clone()).collect();
        Ok(Planned::Work(Plan {
            kind: RequestKind::DropTable,
            work: Work::Tables(Self::tasks(regions, TableAction::Remove, &affected)),
            completion: Completion::DropTables { tables: names },
        }))
    }

    fn drop_child(&self, table: &TableMetadata) -> EngineResult<Planned> {
        let child = self.store.get_table(&table.name)?.unwrap_or_else(|| table.clone());
        let regions = self.region_names(&child.regions)?;
        Ok(Planned::Work(Plan {
            kind: RequestKind::DropChildTable,
            work: Work::Tables(Self::tasks(regions, TableAction::Remove, std::slice::from_ref(&child))),
            completion: Completion::DropTables {
                tables: vec![child.name.clone()],
            },
        }))
    }

    fn add_region(&self, region: &str) -> EngineResult<Planned> {
        let Some(name) = self.sources.get(&region_key(region)) else {
            return Err(EngineError::UnknownRegion {
                request_id: self.request.id,
                region: region.to_string(),
            });
        };
        let id = self.store.register_region(name)?;
        debug!(region = %name, id, "region registered locally");
        Ok(Planned::Work(Plan {
            kind: RequestKind::AddRegion,
            work: Work::AddRegion(name.clone()),
            completion: Completion::RegionAdded {
                region: name.clone(),
            },
        }))
    }

    fn remove_region(&self, region: &str) -> Planned {
        let name = self
            .sources
            .get(&region_key(region))
            .cloned()
            .unwrap_or_else(|| region.to_string());
        Planned::Work(Plan {
            kind: RequestKind::RemoveRegion,
            work: Work::RemoveRegion(name.clone()),
            completion: Completion::RegionRemoved { region: name },
        })
    }
}
