use crate::error::{RegistryError, Result};
use crate::page::{Page, Paginated};
use crate::quota;
use crate::storage::JsonStore;
use crate::tokens::TokenIssuer;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vpn_types::{
    listen_slot, listen_slots_conflict, EmailValidator, EndpointValidator, HostValidator, NameValidator, NewNode, NewPlan,
    NewReseller, NewService, NewUser, Node, NodeId, Plan, PlanId, PlanSubscription, Reseller,
    ResellerId, Scope, Service, ServiceId, ServiceUpdate, SubscriptionToken, UrlValidator, User,
    UserId, WalletTransaction, WalletTransactionKind,
};

pub const REGISTRY_FILE: &str = "registry.json";

/// Inbound port for services without an endpoint unless configured otherwise.
pub const DEFAULT_LISTEN_PORT: u16 = 443;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IdCounters {
    user: u64,
    reseller: u64,
    plan: u64,
    service: u64,
    node: u64,
    wallet_transaction: u64,
}

fn next_id(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

/// Everything the registry owns except tokens, which live in the issuer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RegistryState {
    #[serde(default)]
    pub(crate) users: BTreeMap<UserId, User>,
    #[serde(default)]
    pub(crate) resellers: BTreeMap<ResellerId, Reseller>,
    #[serde(default)]
    pub(crate) plans: BTreeMap<PlanId, Plan>,
    #[serde(default)]
    pub(crate) services: BTreeMap<ServiceId, Service>,
    #[serde(default)]
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    #[serde(default)]
    pub(crate) wallet_transactions: Vec<WalletTransaction>,
    #[serde(default)]
    next_ids: IdCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RegistryDocument {
    state: RegistryState,
    #[serde(default)]
    tokens: Vec<SubscriptionToken>,
}

/// Usage summary returned by the reseller report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResellerReport {
    pub reseller_id: ResellerId,
    pub users: usize,
    pub services: usize,
    pub traffic_used_bytes: u64,
    pub plan: Option<Plan>,
    pub wallet_balance: i64,
}

/// A service selected for rendering together with its token.
#[derive(Debug, Clone)]
pub struct EligibleService {
    pub service: Service,
    pub token: SubscriptionToken,
}

/// One consistent read of registry state taken for a render.
#[derive(Debug, Clone)]
pub struct RenderView {
    pub taken_at: DateTime<Utc>,
    pub enforcement: quota::EnforcementReport,
    /// Ordered by service id.
    pub services: Vec<EligibleService>,
    pub nodes: BTreeMap<NodeId, Node>,
}

/// Resolved `/sub/<token>` lookup.
#[derive(Debug, Clone)]
pub struct SubscriptionLookup {
    pub service: Service,
    pub token: SubscriptionToken,
    pub nodes: Vec<Node>,
}

/// Service registry.
///
/// All mutable rows sit behind one `RwLock` so a render observes a single
/// consistent state; tokens are issued through the `TokenIssuer` without
/// taking the write side of that lock. Writes are staged on a copy of the
/// state and only become visible once persisted.
pub struct Registry {
    state: RwLock<RegistryState>,
    tokens: TokenIssuer,
    store: Option<Mutex<JsonStore<RegistryDocument>>>,
    default_listen_port: u16,
}

impl Registry {
    /// Registry without persistence.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            tokens: TokenIssuer::new(),
            store: None,
            default_listen_port: DEFAULT_LISTEN_PORT,
        }
    }

    /// Registry persisted to `<data_dir>/registry.json`, loading any saved state.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let store: JsonStore<RegistryDocument> = JsonStore::new(data_dir.as_ref().join(REGISTRY_FILE));

        let (state, tokens) = match store.load()? {
            Some(document) => {
                info!(
                    path = %store.path().display(),
                    services = document.state.services.len(),
                    nodes = document.state.nodes.len(),
                    "Loaded registry state"
                );
                (document.state, TokenIssuer::from_tokens(document.tokens))
            }
            None => (RegistryState::default(), TokenIssuer::new()),
        };

        Ok(Self {
            state: RwLock::new(state),
            tokens,
            store: Some(Mutex::new(store)),
            default_listen_port: DEFAULT_LISTEN_PORT,
        })
    }

    /// Port that endpoint-less services listen on, used to reject endpoints
    /// whose inbound could not coexist with the existing ones.
    pub fn with_default_listen_port(mut self, port: u16) -> Self {
        self.default_listen_port = port;
        self
    }

    /// Must be called while holding either side of the state lock so that
    /// the document written is the freshest one.
    fn persist(&self, state: &RegistryState) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let store = store
            .lock()
            .map_err(|_| RegistryError::Storage("registry store lock poisoned".to_string()))?;

        let document = RegistryDocument {
            state: state.clone(),
            tokens: self.tokens.all(),
        };
        store.save(&document)
    }

    /// Persist the staged state, then make it live. On error the live state
    /// is left as it was.
    fn commit(&self, live: &mut RegistryState, staged: RegistryState) -> Result<()> {
        self.persist(&staged)?;
        *live = staged;
        Ok(())
    }

    // Users

    pub async fn create_user(&self, scope: Scope, new_user: NewUser) -> Result<User> {
        EmailValidator::default().validate(&new_user.email)?;
        NameValidator::default().validate("full_name", &new_user.full_name)?;

        let mut live = self.state.write().await;
        let mut state = live.clone();
        let owner = resolve_owner(&state, scope, new_user.reseller_id)?;

        let email = new_user.email.trim().to_lowercase();
        if state.users.values().any(|u| u.email == email) {
            return Err(RegistryError::validation("email", "already registered"));
        }

        if let Some(reseller_id) = owner {
            quota::ensure_user_capacity(&state, reseller_id, Utc::now())?;
        }

        let id = next_id(&mut state.next_ids.user);
        let user = User {
            id,
            email,
            full_name: new_user.full_name.trim().to_string(),
            reseller_id: owner,
            created_at: Utc::now(),
        };
        state.users.insert(id, user.clone());
        self.commit(&mut live, state)?;

        info!(user_id = id, reseller_id = ?owner, "Created user");
        Ok(user)
    }

    pub async fn get_user(&self, scope: Scope, id: UserId) -> Result<User> {
        let state = self.state.read().await;
        state
            .users
            .get(&id)
            .filter(|user| scope.permits(user.reseller_id))
            .cloned()
            .ok_or_else(|| RegistryError::not_found("User", id))
    }

    pub async fn list_users(&self, scope: Scope, page: Page) -> Paginated<User> {
        let state = self.state.read().await;
        page.apply(
            state
                .users
                .values()
                .filter(|user| scope.permits(user.reseller_id))
                .cloned(),
        )
    }

    // Resellers and wallet

    pub async fn create_reseller(&self, new_reseller: NewReseller) -> Result<Reseller> {
        NameValidator::default().validate("name", &new_reseller.name)?;
        NameValidator::default().validate("auth_username", &new_reseller.auth_username)?;
        if let Some(email) = &new_reseller.contact_email {
            EmailValidator::default().validate(email)?;
        }

        let mut live = self.state.write().await;
        let mut state = live.clone();
        let auth_username = new_reseller.auth_username.trim().to_string();
        if state.resellers.values().any(|r| r.auth_username == auth_username) {
            return Err(RegistryError::validation("auth_username", "already mapped to a reseller"));
        }

        let id = next_id(&mut state.next_ids.reseller);
        let reseller = Reseller {
            id,
            name: new_reseller.name.trim().to_string(),
            auth_username,
            contact_email: new_reseller.contact_email,
            wallet_balance: 0,
            subscription: None,
            created_at: Utc::now(),
        };
        state.resellers.insert(id, reseller.clone());
        self.commit(&mut live, state)?;

        info!(reseller_id = id, "Created reseller");
        Ok(reseller)
    }

    pub async fn get_reseller(&self, scope: Scope, id: ResellerId) -> Result<Reseller> {
        let state = self.state.read().await;
        state
            .resellers
            .get(&id)
            .filter(|reseller| scope.permits(Some(reseller.id)))
            .cloned()
            .ok_or_else(|| RegistryError::not_found("Reseller", id))
    }

    pub async fn list_resellers(&self) -> Vec<Reseller> {
        self.state.read().await.resellers.values().cloned().collect()
    }

    /// Reseller whose operator login is `username`.
    pub async fn reseller_by_username(&self, username: &str) -> Option<Reseller> {
        let state = self.state.read().await;
        state
            .resellers
            .values()
            .find(|reseller| reseller.auth_username == username)
            .cloned()
    }

    pub async fn credit_wallet(
        &self,
        reseller_id: ResellerId,
        amount: i64,
        reason: Option<String>,
    ) -> Result<Reseller> {
        if amount <= 0 {
            return Err(RegistryError::validation("amount", "must be positive"));
        }

        let mut live = self.state.write().await;
        let mut state = live.clone();
        let reseller = state
            .resellers
            .get_mut(&reseller_id)
            .ok_or_else(|| RegistryError::not_found("Reseller", reseller_id))?;
        reseller.wallet_balance = reseller.wallet_balance.saturating_add(amount);
        let updated = reseller.clone();

        record_transaction(&mut state, reseller_id, amount, WalletTransactionKind::Credit, reason);
        self.commit(&mut live, state)?;

        info!(reseller_id, amount, balance = updated.wallet_balance, "Credited wallet");
        Ok(updated)
    }

    pub async fn wallet_transactions(
        &self,
        scope: Scope,
        reseller_id: ResellerId,
    ) -> Result<Vec<WalletTransaction>> {
        let state = self.state.read().await;
        if !scope.permits(Some(reseller_id)) || !state.resellers.contains_key(&reseller_id) {
            return Err(RegistryError::not_found("Reseller", reseller_id));
        }

        Ok(state
            .wallet_transactions
            .iter()
            .filter(|tx| tx.reseller_id == reseller_id)
            .cloned()
            .collect())
    }

    // Plans

    pub async fn create_plan(&self, new_plan: NewPlan) -> Result<Plan> {
        NameValidator::default().validate("name", &new_plan.name)?;
        if new_plan.price < 0 {
            return Err(RegistryError::validation("price", "must not be negative"));
        }
        if new_plan.duration_days == 0 {
            return Err(RegistryError::validation("duration_days", "must be at least 1"));
        }

        let mut live = self.state.write().await;
        let mut state = live.clone();
        let id = next_id(&mut state.next_ids.plan);
        let plan = Plan {
            id,
            name: new_plan.name.trim().to_string(),
            price: new_plan.price,
            duration_days: new_plan.duration_days,
            max_users: new_plan.max_users,
            max_services: new_plan.max_services,
            max_traffic_bytes: new_plan.max_traffic_bytes,
            max_concurrent_total: new_plan.max_concurrent_total,
            is_active: new_plan.is_active,
            created_at: Utc::now(),
        };
        state.plans.insert(id, plan.clone());
        self.commit(&mut live, state)?;

        info!(plan_id = id, price = plan.price, "Created plan");
        Ok(plan)
    }

    pub async fn list_plans(&self) -> Vec<Plan> {
        self.state.read().await.plans.values().cloned().collect()
    }

    pub async fn get_plan(&self, id: PlanId) -> Result<Plan> {
        let state = self.state.read().await;
        state
            .plans
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("Plan", id))
    }

    /// Purchase a plan from the reseller's wallet. Nothing changes unless
    /// the whole purchase succeeds.
    pub async fn subscribe(
        &self,
        scope: Scope,
        reseller_id: ResellerId,
        plan_id: PlanId,
    ) -> Result<Reseller> {
        let mut live = self.state.write().await;
        let mut state = live.clone();

        if !scope.permits(Some(reseller_id)) {
            return Err(RegistryError::Forbidden(format!(
                "cannot subscribe reseller {}",
                reseller_id
            )));
        }

        let plan = state
            .plans
            .get(&plan_id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("Plan", plan_id))?;
        if !plan.is_active {
            return Err(RegistryError::validation("plan_id", "plan is not active"));
        }

        let now = Utc::now();
        let reseller = state
            .resellers
            .get_mut(&reseller_id)
            .ok_or_else(|| RegistryError::not_found("Reseller", reseller_id))?;

        if reseller.wallet_balance < plan.price {
            return Err(RegistryError::InsufficientFunds {
                balance: reseller.wallet_balance,
                price: plan.price,
            });
        }

        reseller.wallet_balance -= plan.price;
        reseller.subscription = Some(PlanSubscription {
            plan_id,
            starts_at: now,
            ends_at: now + Duration::days(i64::from(plan.duration_days)),
        });
        let updated = reseller.clone();

        record_transaction(
            &mut state,
            reseller_id,
            plan.price,
            WalletTransactionKind::Debit,
            Some(format!("plan:{}", plan.id)),
        );
        self.commit(&mut live, state)?;

        info!(reseller_id, plan_id, price = plan.price, "Reseller subscribed to plan");
        Ok(updated)
    }

    pub async fn reseller_report(&self, scope: Scope, reseller_id: ResellerId) -> Result<ResellerReport> {
        let state = self.state.read().await;
        let reseller = state
            .resellers
            .get(&reseller_id)
            .filter(|reseller| scope.permits(Some(reseller.id)))
            .ok_or_else(|| RegistryError::not_found("Reseller", reseller_id))?;

        let owned = |owner: Option<ResellerId>| owner == Some(reseller_id);
        let services: Vec<&Service> = state
            .services
            .values()
            .filter(|service| owned(service.reseller_id))
            .collect();

        Ok(ResellerReport {
            reseller_id,
            users: state.users.values().filter(|u| owned(u.reseller_id)).count(),
            services: services.len(),
            traffic_used_bytes: services
                .iter()
                .fold(0u64, |acc, s| acc.saturating_add(s.traffic_used_bytes)),
            plan: reseller
                .subscription
                .as_ref()
                .and_then(|sub| state.plans.get(&sub.plan_id).cloned()),
            wallet_balance: reseller.wallet_balance,
        })
    }

    // Services

    /// Validates input and plan ceilings before inserting; a failure leaves
    /// the registry untouched.
    pub async fn create_service(&self, scope: Scope, new_service: NewService) -> Result<Service> {
        validate_service_fields(
            &new_service.name,
            new_service.endpoint.as_deref(),
            new_service.ip_limit,
            new_service.concurrent_limit,
        )?;

        let mut live = self.state.write().await;
        let mut state = live.clone();
        let owner = resolve_owner(&state, scope, new_service.reseller_id)?;

        state
            .users
            .get(&new_service.user_id)
            .filter(|user| scope.permits(user.reseller_id))
            .ok_or_else(|| RegistryError::not_found("User", new_service.user_id))?;

        let now = Utc::now();
        let mut service = Service {
            id: 0,
            name: new_service.name.trim().to_string(),
            user_id: new_service.user_id,
            reseller_id: owner,
            protocol: new_service.protocol,
            endpoint: new_service.endpoint.map(|e| e.trim().to_string()),
            traffic_limit_bytes: new_service.traffic_limit_bytes,
            traffic_used_bytes: 0,
            expires_at: new_service.expires_at,
            ip_limit: new_service.ip_limit,
            concurrent_limit: new_service.concurrent_limit,
            is_active: false,
            node_ids: BTreeSet::new(),
            created_at: now,
        };
        service.is_active = service.should_be_active(now);
        if new_service.is_active == Some(false) {
            debug!("Ignoring requested is_active=false; activation is derived from expiry and usage");
        }

        if let Some(reseller_id) = owner {
            quota::ensure_service_capacity(&state, reseller_id, &service, None, now)?;
        }
        ensure_listen_slot_free(&state, &service, self.default_listen_port)?;

        service.id = next_id(&mut state.next_ids.service);
        state.services.insert(service.id, service.clone());
        self.commit(&mut live, state)?;

        info!(
            service_id = service.id,
            user_id = service.user_id,
            reseller_id = ?owner,
            is_active = service.is_active,
            "Created service"
        );
        Ok(service)
    }

    pub async fn get_service(&self, scope: Scope, id: ServiceId) -> Result<Service> {
        let state = self.state.read().await;
        visible_service(&state, scope, id).cloned()
    }

    /// Services visible to `scope`, ordered by id.
    pub async fn list_services(&self, scope: Scope, page: Page) -> Paginated<Service> {
        let state = self.state.read().await;
        page.apply(
            state
                .services
                .values()
                .filter(|service| scope.permits(service.reseller_id))
                .cloned(),
        )
    }

    pub async fn update_service(
        &self,
        scope: Scope,
        id: ServiceId,
        update: ServiceUpdate,
    ) -> Result<Service> {
        validate_service_fields(
            &update.name,
            update.endpoint.as_deref(),
            update.ip_limit,
            update.concurrent_limit,
        )?;

        let mut live = self.state.write().await;
        let mut state = live.clone();
        let mut service = visible_service(&state, scope, id)?.clone();

        service.name = update.name.trim().to_string();
        service.protocol = update.protocol;
        service.endpoint = update.endpoint.map(|e| e.trim().to_string());
        service.traffic_limit_bytes = update.traffic_limit_bytes;
        service.expires_at = update.expires_at;
        service.ip_limit = update.ip_limit;
        service.concurrent_limit = update.concurrent_limit;

        let now = Utc::now();
        service.is_active = service.should_be_active(now);

        if let Some(reseller_id) = service.reseller_id {
            quota::ensure_service_capacity(&state, reseller_id, &service, Some(id), now)?;
        }
        ensure_listen_slot_free(&state, &service, self.default_listen_port)?;

        state.services.insert(id, service.clone());
        self.commit(&mut live, state)?;

        info!(service_id = id, is_active = service.is_active, "Updated service");
        Ok(service)
    }

    /// Replace the service's node assignment. Every id is checked before
    /// anything is written.
    pub async fn assign_nodes(
        &self,
        scope: Scope,
        service_id: ServiceId,
        node_ids: &[NodeId],
    ) -> Result<Service> {
        let mut live = self.state.write().await;
        let mut state = live.clone();
        visible_service(&state, scope, service_id)?;

        if let Some(missing) = node_ids.iter().find(|id| !state.nodes.contains_key(id)) {
            return Err(RegistryError::not_found("Node", missing));
        }

        let service = state
            .services
            .get_mut(&service_id)
            .ok_or_else(|| RegistryError::not_found("Service", service_id))?;
        service.node_ids = node_ids.iter().copied().collect();
        let updated = service.clone();
        self.commit(&mut live, state)?;

        info!(service_id, nodes = ?updated.node_ids, "Assigned nodes to service");
        Ok(updated)
    }

    /// Add consumed traffic reported by the accounting collaborator. The
    /// counter never decreases.
    pub async fn record_usage(&self, service_id: ServiceId, bytes: u64) -> Result<Service> {
        let mut live = self.state.write().await;
        let mut state = live.clone();
        let now = Utc::now();
        let service = state
            .services
            .get_mut(&service_id)
            .ok_or_else(|| RegistryError::not_found("Service", service_id))?;

        service.traffic_used_bytes = service.traffic_used_bytes.saturating_add(bytes);
        let was_active = service.is_active;
        service.is_active = service.should_be_active(now);
        let updated = service.clone();
        self.commit(&mut live, state)?;

        if was_active && !updated.is_active {
            warn!(
                service_id,
                used = updated.traffic_used_bytes,
                limit = ?updated.traffic_limit_bytes,
                "Service reached its traffic limit"
            );
        }
        Ok(updated)
    }

    // Nodes

    pub async fn create_node(&self, new_node: NewNode) -> Result<Node> {
        NameValidator::default().validate("name", &new_node.name)?;
        NameValidator::default().validate("location", &new_node.location)?;
        HostValidator::validate("ip_address", new_node.ip_address.trim())?;
        UrlValidator::validate("api_base_url", new_node.api_base_url.trim())?;
        if new_node.auth_token.trim().is_empty() {
            return Err(RegistryError::validation("auth_token", "must not be empty"));
        }

        let mut live = self.state.write().await;
        let mut state = live.clone();
        let id = next_id(&mut state.next_ids.node);
        let node = Node {
            id,
            name: new_node.name.trim().to_string(),
            location: new_node.location.trim().to_string(),
            ip_address: new_node.ip_address.trim().to_string(),
            api_base_url: new_node.api_base_url.trim().trim_end_matches('/').to_string(),
            auth_token: new_node.auth_token,
            is_active: true,
            last_seen_at: None,
            created_at: Utc::now(),
        };
        state.nodes.insert(id, node.clone());
        self.commit(&mut live, state)?;

        info!(node_id = id, name = %node.name, api_base_url = %node.api_base_url, "Registered node");
        Ok(node)
    }

    pub async fn get_node(&self, id: NodeId) -> Result<Node> {
        let state = self.state.read().await;
        state
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("Node", id))
    }

    pub async fn list_nodes(&self) -> Vec<Node> {
        self.state.read().await.nodes.values().cloned().collect()
    }

    pub async fn set_node_active(&self, id: NodeId, is_active: bool) -> Result<Node> {
        let mut live = self.state.write().await;
        let mut state = live.clone();
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| RegistryError::not_found("Node", id))?;
        node.is_active = is_active;
        let updated = node.clone();
        self.commit(&mut live, state)?;

        info!(node_id = id, is_active, "Changed node activation");
        Ok(updated)
    }

    /// Record a successful push to the node.
    pub async fn touch_node(&self, id: NodeId, seen_at: DateTime<Utc>) -> Result<()> {
        let mut live = self.state.write().await;
        let mut state = live.clone();
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| RegistryError::not_found("Node", id))?;
        node.last_seen_at = Some(seen_at);
        self.commit(&mut live, state)
    }

    // Tokens

    /// Return the service's token, issuing one on first use. Works whatever
    /// the service's activation or quota state.
    pub async fn ensure_token(&self, scope: Scope, service_id: ServiceId) -> Result<SubscriptionToken> {
        let state = self.state.read().await;
        visible_service(&state, scope, service_id)?;

        let (token, created) = self.tokens.ensure(service_id);
        if created {
            if let Err(e) = self.persist(&state) {
                self.tokens.discard(&token);
                return Err(e);
            }
            info!(service_id, token_id = token.id, "Issued subscription token");
        }
        Ok(token)
    }

    pub async fn token_for_service(&self, scope: Scope, service_id: ServiceId) -> Result<Option<SubscriptionToken>> {
        let state = self.state.read().await;
        visible_service(&state, scope, service_id)?;
        Ok(self.tokens.get(service_id))
    }

    /// Resolve a presented subscription token, without any caller scope.
    pub async fn lookup_subscription(&self, token: &str) -> Option<SubscriptionLookup> {
        let service_id = self.tokens.service_for(token)?;
        let token = self.tokens.get(service_id)?;

        let state = self.state.read().await;
        let service = state.services.get(&service_id)?.clone();
        let nodes = service
            .node_ids
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect();

        Some(SubscriptionLookup { service, token, nodes })
    }

    // Quota

    /// Recompute every service's activation flag and persist any change.
    pub async fn enforce(&self) -> Result<quota::EnforcementReport> {
        let mut live = self.state.write().await;
        let mut state = live.clone();
        let report = quota::enforce_services(&mut state.services, Utc::now());

        if report.changed() {
            self.commit(&mut live, state)?;
            info!(
                deactivated = ?report.deactivated,
                reactivated = ?report.reactivated,
                "Quota enforcement changed service activation"
            );
        }
        Ok(report)
    }

    /// Enforce, then select eligible services and issue their missing tokens,
    /// all under one write lock.
    pub async fn render_view(&self) -> Result<RenderView> {
        let mut live = self.state.write().await;
        let mut state = live.clone();
        let now = Utc::now();
        let enforcement = quota::enforce_services(&mut state.services, now);

        let mut issued = Vec::new();
        let services: Vec<EligibleService> = state
            .services
            .values()
            .filter(|service| quota::check(service, now))
            .map(|service| {
                let (token, created) = self.tokens.ensure(service.id);
                if created {
                    issued.push(token.clone());
                }
                EligibleService {
                    service: service.clone(),
                    token,
                }
            })
            .collect();

        if enforcement.changed() || !issued.is_empty() {
            if let Err(e) = self.persist(&state) {
                for token in &issued {
                    self.tokens.discard(token);
                }
                return Err(e);
            }
        }

        debug!(
            eligible = services.len(),
            issued_tokens = issued.len(),
            deactivated = enforcement.deactivated.len(),
            "Collected render view"
        );

        let nodes = state.nodes.clone();
        *live = state;

        Ok(RenderView {
            taken_at: now,
            enforcement,
            services,
            nodes,
        })
    }

    pub async fn service_count(&self) -> usize {
        self.state.read().await.services.len()
    }
}

fn visible_service(state: &RegistryState, scope: Scope, id: ServiceId) -> Result<&Service> {
    state
        .services
        .get(&id)
        .filter(|service| scope.permits(service.reseller_id))
        .ok_or_else(|| RegistryError::not_found("Service", id))
}

/// The reseller a new row belongs to. Resellers always write under their own
/// id; admins may name any existing reseller or none.
fn resolve_owner(
    state: &RegistryState,
    scope: Scope,
    requested: Option<ResellerId>,
) -> Result<Option<ResellerId>> {
    match scope {
        Scope::Reseller(own) => match requested {
            Some(other) if other != own => Err(RegistryError::Forbidden(
                "reseller scope violation".to_string(),
            )),
            _ => Ok(Some(own)),
        },
        Scope::Admin => {
            if let Some(id) = requested {
                if !state.resellers.contains_key(&id) {
                    return Err(RegistryError::not_found("Reseller", id));
                }
            }
            Ok(requested)
        }
    }
}

fn validate_service_fields(
    name: &str,
    endpoint: Option<&str>,
    ip_limit: Option<u32>,
    concurrent_limit: Option<u32>,
) -> Result<()> {
    NameValidator::default().validate("name", name)?;
    if let Some(endpoint) = endpoint {
        EndpointValidator::parse(endpoint)?;
    }
    if ip_limit == Some(0) {
        return Err(RegistryError::validation("ip_limit", "must be at least 1"));
    }
    if concurrent_limit == Some(0) {
        return Err(RegistryError::validation("concurrent_limit", "must be at least 1"));
    }
    Ok(())
}

/// Reject a service whose inbound would share a port with an existing one
/// on an incompatible listen address; such a document could never render.
fn ensure_listen_slot_free(state: &RegistryState, candidate: &Service, default_port: u16) -> Result<()> {
    let wanted = listen_slot(candidate.endpoint.as_deref(), default_port)?;
    for other in state.services.values().filter(|s| s.id != candidate.id) {
        let Ok(taken) = listen_slot(other.endpoint.as_deref(), default_port) else {
            continue;
        };
        if listen_slots_conflict(&wanted, &taken) {
            return Err(RegistryError::validation(
                "endpoint",
                format!(
                    "port {} is already served on {}; cannot also listen on {}",
                    wanted.1, taken.0, wanted.0
                ),
            ));
        }
    }
    Ok(())
}

fn record_transaction(
    state: &mut RegistryState,
    reseller_id: ResellerId,
    amount: i64,
    kind: WalletTransactionKind,
    reason: Option<String>,
) {
    let id = next_id(&mut state.next_ids.wallet_transaction);
    state.wallet_transactions.push(WalletTransaction {
        id,
        reseller_id,
        amount,
        kind,
        reason,
        created_at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn new_node(name: &str) -> NewNode {
        NewNode {
            name: name.to_string(),
            location: "Frankfurt".to_string(),
            ip_address: "203.0.113.7".to_string(),
            api_base_url: "http://203.0.113.7:9000/".to_string(),
            auth_token: "node-secret".to_string(),
        }
    }

    fn new_user(email: &str, reseller_id: Option<ResellerId>) -> NewUser {
        NewUser {
            email: email.to_string(),
            full_name: "Test User".to_string(),
            reseller_id,
        }
    }

    fn new_service(user_id: UserId) -> NewService {
        NewService {
            name: "Core".to_string(),
            user_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_service_requires_known_user() {
        let registry = Registry::in_memory();
        let err = registry
            .create_service(Scope::Admin, new_service(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
        assert_eq!(registry.service_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_service_validates_endpoint() {
        let registry = Registry::in_memory();
        let user = registry
            .create_user(Scope::Admin, new_user("a@example.com", None))
            .await
            .unwrap();

        let mut draft = new_service(user.id);
        draft.endpoint = Some("no-port".to_string());
        let err = registry.create_service(Scope::Admin, draft).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_expired_service_is_created_inactive() {
        let registry = Registry::in_memory();
        let user = registry
            .create_user(Scope::Admin, new_user("a@example.com", None))
            .await
            .unwrap();

        let mut draft = new_service(user.id);
        draft.expires_at = Some(Utc::now() - Duration::hours(1));
        draft.is_active = Some(true);
        let service = registry.create_service(Scope::Admin, draft).await.unwrap();
        assert!(!service.is_active);
    }

    #[tokio::test]
    async fn test_reseller_scope_hides_other_rows() {
        let registry = Registry::in_memory();
        let first = registry.create_reseller(NewReseller {
            name: "First".to_string(),
            auth_username: "first".to_string(),
            contact_email: None,
        }).await.unwrap();
        let second = registry.create_reseller(NewReseller {
            name: "Second".to_string(),
            auth_username: "second".to_string(),
            contact_email: None,
        }).await.unwrap();

        let scope = Scope::Reseller(first.id);
        let user = registry
            .create_user(scope, new_user("u@example.com", None))
            .await
            .unwrap();
        assert_eq!(user.reseller_id, Some(first.id));

        let service = registry.create_service(scope, new_service(user.id)).await.unwrap();
        assert_eq!(service.reseller_id, Some(first.id));

        let other = Scope::Reseller(second.id);
        assert!(registry.get_service(other, service.id).await.is_err());
        assert!(registry.list_services(other, Page::default()).await.items.is_empty());
        assert_eq!(registry.list_services(Scope::Admin, Page::default()).await.items.len(), 1);

        let mut foreign = new_service(user.id);
        foreign.reseller_id = Some(second.id);
        assert!(matches!(
            registry.create_service(scope, foreign).await,
            Err(RegistryError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_debits_wallet() {
        let registry = Registry::in_memory();
        let reseller = registry.create_reseller(NewReseller {
            name: "Shop".to_string(),
            auth_username: "shop".to_string(),
            contact_email: Some("shop@example.com".to_string()),
        }).await.unwrap();
        let plan = registry.create_plan(NewPlan {
            name: "Starter".to_string(),
            price: 500,
            duration_days: 30,
            max_users: Some(10),
            max_services: Some(10),
            max_traffic_bytes: None,
            max_concurrent_total: None,
            is_active: true,
        }).await.unwrap();

        let err = registry
            .subscribe(Scope::Admin, reseller.id, plan.id)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InsufficientFunds { balance: 0, price: 500 }));

        registry.credit_wallet(reseller.id, 800, Some("top-up".to_string())).await.unwrap();
        let subscribed = registry
            .subscribe(Scope::Reseller(reseller.id), reseller.id, plan.id)
            .await
            .unwrap();

        assert_eq!(subscribed.wallet_balance, 300);
        let subscription = subscribed.subscription.unwrap();
        assert_eq!(subscription.plan_id, plan.id);
        assert_eq!(subscription.ends_at - subscription.starts_at, Duration::days(30));

        let ledger = registry
            .wallet_transactions(Scope::Admin, reseller.id)
            .await
            .unwrap();
        let kinds: Vec<_> = ledger.iter().map(|tx| tx.kind).collect();
        assert_eq!(kinds, vec![WalletTransactionKind::Credit, WalletTransactionKind::Debit]);
    }

    #[tokio::test]
    async fn test_node_base_url_is_normalized_and_touch_updates_last_seen() {
        let registry = Registry::in_memory();
        let node = registry.create_node(new_node("edge-1")).await.unwrap();
        assert_eq!(node.api_base_url, "http://203.0.113.7:9000");
        assert!(node.last_seen_at.is_none());

        let seen = Utc::now();
        registry.touch_node(node.id, seen).await.unwrap();
        assert_eq!(registry.get_node(node.id).await.unwrap().last_seen_at, Some(seen));
        assert!(registry.touch_node(99, seen).await.is_err());
    }

    #[tokio::test]
    async fn test_record_usage_deactivates_at_limit() {
        let registry = Registry::in_memory();
        let user = registry
            .create_user(Scope::Admin, new_user("a@example.com", None))
            .await
            .unwrap();
        let mut draft = new_service(user.id);
        draft.traffic_limit_bytes = Some(1_000);
        let service = registry.create_service(Scope::Admin, draft).await.unwrap();

        let service_after = registry.record_usage(service.id, 999).await.unwrap();
        assert!(service_after.is_active);

        let service_after = registry.record_usage(service.id, 1).await.unwrap();
        assert!(!service_after.is_active);
        assert_eq!(service_after.traffic_used_bytes, 1_000);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let (service_id, token) = {
            let registry = Registry::open(dir.path()).unwrap();
            let user = registry
                .create_user(Scope::Admin, new_user("a@example.com", None))
                .await
                .unwrap();
            let service = registry.create_service(Scope::Admin, new_service(user.id)).await.unwrap();
            let token = registry.ensure_token(Scope::Admin, service.id).await.unwrap();
            (service.id, token)
        };

        let reopened = Registry::open(dir.path()).unwrap();
        assert_eq!(reopened.get_service(Scope::Admin, service_id).await.unwrap().name, "Core");
        assert_eq!(reopened.ensure_token(Scope::Admin, service_id).await.unwrap(), token);

        let user = reopened
            .create_user(Scope::Admin, new_user("b@example.com", None))
            .await
            .unwrap();
        assert_eq!(user.id, 2);
    }

    #[tokio::test]
    async fn test_lookup_subscription_resolves_nodes() {
        let registry = Registry::in_memory();
        let user = registry
            .create_user(Scope::Admin, new_user("a@example.com", None))
            .await
            .unwrap();
        let service = registry.create_service(Scope::Admin, new_service(user.id)).await.unwrap();
        let node = registry.create_node(new_node("edge-1")).await.unwrap();
        registry.assign_nodes(Scope::Admin, service.id, &[node.id]).await.unwrap();
        let token = registry.ensure_token(Scope::Admin, service.id).await.unwrap();

        let lookup = registry.lookup_subscription(&token.token).await.unwrap();
        assert_eq!(lookup.service.id, service.id);
        assert_eq!(lookup.nodes.len(), 1);
        assert!(registry.lookup_subscription("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_state_unchanged() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        let user = registry
            .create_user(Scope::Admin, new_user("a@example.com", None))
            .await
            .unwrap();
        let service = registry.create_service(Scope::Admin, new_service(user.id)).await.unwrap();

        // A directory in place of the document makes every save fail.
        let blocker = dir.path().join(REGISTRY_FILE);
        std::fs::remove_file(&blocker).unwrap();
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("held"), b"x").unwrap();

        assert!(registry
            .create_user(Scope::Admin, new_user("b@example.com", None))
            .await
            .is_err());
        assert!(registry.get_user(Scope::Admin, 2).await.is_err());
        assert!(registry.create_service(Scope::Admin, new_service(user.id)).await.is_err());
        assert_eq!(registry.service_count().await, 1);
        assert!(registry.ensure_token(Scope::Admin, service.id).await.is_err());
        assert_eq!(registry.token_for_service(Scope::Admin, service.id).await.unwrap(), None);
        assert!(registry.render_view().await.is_err());
        assert_eq!(registry.token_for_service(Scope::Admin, service.id).await.unwrap(), None);

        std::fs::remove_dir_all(&blocker).unwrap();
        let retried = registry
            .create_user(Scope::Admin, new_user("b@example.com", None))
            .await
            .unwrap();
        assert_eq!(retried.id, 2);

        let reopened = Registry::open(dir.path()).unwrap();
        assert_eq!(reopened.list_users(Scope::Admin, Page::default()).await.items.len(), 2);
        assert_eq!(reopened.service_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_rejects_endpoint_that_cannot_share_port() {
        let registry = Registry::in_memory();
        let user = registry
            .create_user(Scope::Admin, new_user("a@example.com", None))
            .await
            .unwrap();
        registry.create_service(Scope::Admin, new_service(user.id)).await.unwrap();

        let mut pinned = new_service(user.id);
        pinned.endpoint = Some("203.0.113.9:8443".to_string());
        let pinned = registry.create_service(Scope::Admin, pinned).await.unwrap();

        let update = ServiceUpdate {
            name: "Core".to_string(),
            protocol: pinned.protocol,
            endpoint: Some("203.0.113.9:443".to_string()),
            traffic_limit_bytes: None,
            expires_at: None,
            ip_limit: None,
            concurrent_limit: None,
        };
        let err = registry
            .update_service(Scope::Admin, pinned.id, update.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation { .. }));
        let unchanged = registry.get_service(Scope::Admin, pinned.id).await.unwrap();
        assert_eq!(unchanged.endpoint.as_deref(), Some("203.0.113.9:8443"));

        // Moving the service onto its own existing slot is fine.
        let same_slot = ServiceUpdate {
            endpoint: Some("203.0.113.9:8443".to_string()),
            ..update
        };
        assert!(registry.update_service(Scope::Admin, pinned.id, same_slot).await.is_ok());
    }
}
