use crate::{backend::connect_state_db, config::HarnessConfig, pgqueue::PgStore};
use relay_core::{RelayStore, SubNode};

/// Parse a SubNode declaration: `owner` or `owner=id`.
pub fn parse_declaration(raw: &str) -> anyhow::Result<(String, Option<String>)> {
    let (owner, id) = match raw.split_once('=') {
        Some((owner, id)) => (owner.trim(), Some(id.trim())),
        None => (raw.trim(), None),
    };
    anyhow::ensure!(!owner.is_empty(), "SubNode declaration {raw:?} has no owner");
    if let Some(id) = id {
        anyhow::ensure!(!id.is_empty(), "SubNode declaration {raw:?} has an empty id");
    }
    Ok((owner.to_string(), id.map(str::to_string)))
}

/// Upsert every declaration into `store`.
pub async fn declare(store: &dyn RelayStore, declarations: &[String]) -> anyhow::Result<Vec<SubNode>> {
    let mut out = Vec::with_capacity(declarations.len());
    for raw in declarations.iter().filter(|s| !s.trim().is_empty()) {
        let (owner, id) = parse_declaration(raw)?;
        let node = store.create_subnode(&owner, id.as_deref()).await?;
        tracing::info!(
            event = "harness.subnode.declared",
            subnode_id = %node.id,
            owner = %node.owner,
            "subnode declared"
        );
        out.push(node);
    }
    Ok(out)
}

async fn store(cfg: &HarnessConfig) -> anyhow::Result<PgStore> {
    Ok(PgStore::new(connect_state_db(cfg).await?))
}

pub async fn add(cfg: &HarnessConfig, owner: &str, id: Option<&str>) -> anyhow::Result<()> {
    let node = store(cfg).await?.create_subnode(owner, id).await?;
    println!("{}\t{}", node.id, node.owner);
    Ok(())
}

pub async fn list(cfg: &HarnessConfig) -> anyhow::Result<()> {
    for node in store(cfg).await?.list_subnodes().await? {
        println!("{}\t{}", node.id, node.owner);
    }
    Ok(())
}

pub async fn remove(cfg: &HarnessConfig, id: &str) -> anyhow::Result<()> {
    if store(cfg).await?.delete_subnode(id).await? {
        println!("removed {id}");
    } else {
        anyhow::bail!("no SubNode with id {id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::lite::memory::MemoryStore;

    #[test]
    fn parses_owner_and_optional_id() -> anyhow::Result<()> {
        anyhow::ensure!(parse_declaration("alice")? == ("alice".to_string(), None));
        anyhow::ensure!(
            parse_declaration(" bob = node-b ")? == ("bob".to_string(), Some("node-b".to_string()))
        );
        anyhow::ensure!(parse_declaration("=node-x").is_err());
        anyhow::ensure!(parse_declaration("carol=").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn declare_upserts_by_id() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        declare(&store, &["alice=node-a".into(), "bob".into(), "".into()]).await?;
        declare(&store, &["carol=node-a".into()]).await?;

        let nodes = store.list_subnodes().await?;
        anyhow::ensure!(nodes.len() == 2, "expected 2 nodes, got {nodes:?}");
        let node_a = store.get_subnode("node-a").await?;
        anyhow::ensure!(
            node_a.map(|n| n.owner) == Some("carol".to_string()),
            "node-a owner updated in place"
        );
        Ok(())
    }
}
