use hashbrown::HashMap;
use log::debug;
use rand::distributions::Distribution;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::Dirichlet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::board::{BoardState, STATE_SIZE};
use crate::cancel::{CancelReason, CancellationToken};
use crate::codec::ACTION_SIZE;
use crate::error::EngineError;
use crate::predictor::{resolve_now, Evaluator, NetworkPrediction, Predictor, PredictorError};

const MIN_FLOAT: f32 = f32::MIN;
const EPS: f32 = 1e-8;

/// Version tag embedded in search results so the frontend can gate feature toggles if needed.
pub const SEARCH_RESULT_VERSION: u8 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MctsConfig {
    /// Maximum number of simulations when running a \"full\" search.
    #[serde(default = "default_num_simulations", alias = "numMCTSSims")]
    pub num_simulations: u32,
    /// Divisor applied to `num_simulations` when a partial search is picked. Accepts legacy
    /// `ratio_fullMCTS` field for backwards compatibility.
    #[serde(default = "default_partial_divisor", alias = "ratio_fullMCTS")]
    pub partial_divisor: u32,
    /// Exploration constant in the UCB1 term.
    #[serde(default = "default_cpuct")]
    pub cpuct: f32,
    /// Dirichlet noise concentration parameter (α). Set ≤0 to disable.
    #[serde(default = "default_dirichlet_alpha", alias = "dirichletAlpha")]
    pub dirichlet_alpha: f32,
    /// Weight applied to the sampled Dirichlet noise (0.0 disables mixing).
    #[serde(default = "default_dirichlet_weight")]
    pub dirichlet_weight: f32,
    /// First-play urgency reduction added when an edge was never visited.
    #[serde(default = "default_fpu_reduction", alias = "fpu")]
    pub fpu_reduction: f32,
    /// Probability of running a full search instead of a partial one.
    #[serde(default = "default_prob_full_search", alias = "prob_fullMCTS")]
    pub prob_full_search: f32,
    /// Whether to apply the forced-playout heuristic (AlphaZero style).
    #[serde(default = "default_forced_playouts")]
    pub forced_playouts: bool,
    /// Coefficient `k` used in the forced-playout threshold `sqrt(k * P * n_iter)`.
    #[serde(default = "default_forced_playout_coefficient")]
    pub forced_playout_coefficient: f32,
    /// When true, skip periodic cleanup of the search tree (higher memory usage).
    #[serde(default)]
    pub no_mem_optim: bool,
    /// Interval (in rounds) between transposition-table cleanups.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u16,
    /// Number of recent rounds to retain in the tree during cleanup.
    #[serde(default = "default_retain_rounds")]
    pub retain_rounds: u16,
    /// Visit-count temperature for the root distribution. `0.0` picks a single arg-max move.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Simulations per batch; the cancellation token is polled between batches.
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: u32,
}

fn default_num_simulations() -> u32 {
    128
}
fn default_partial_divisor() -> u32 {
    4
}
fn default_cpuct() -> f32 {
    2.75
}
fn default_dirichlet_alpha() -> f32 {
    0.3
}
fn default_dirichlet_weight() -> f32 {
    0.0
}
fn default_fpu_reduction() -> f32 {
    0.03
}
fn default_prob_full_search() -> f32 {
    1.0
}
fn default_forced_playouts() -> bool {
    false
}
fn default_forced_playout_coefficient() -> f32 {
    0.5
}
fn default_cleanup_interval() -> u16 {
    20
}
fn default_retain_rounds() -> u16 {
    5
}
fn default_temperature() -> f32 {
    1.0
}
fn default_cancel_check_interval() -> u32 {
    8
}

impl Default for MctsConfig {
    fn default() -> Self {
        Self {
            num_simulations: default_num_simulations(),
            partial_divisor: default_partial_divisor(),
            cpuct: default_cpuct(),
            dirichlet_alpha: default_dirichlet_alpha(),
            dirichlet_weight: default_dirichlet_weight(),
            fpu_reduction: default_fpu_reduction(),
            prob_full_search: default_prob_full_search(),
            forced_playouts: default_forced_playouts(),
            forced_playout_coefficient: default_forced_playout_coefficient(),
            no_mem_optim: false,
            cleanup_interval: default_cleanup_interval(),
            retain_rounds: default_retain_rounds(),
            temperature: default_temperature(),
            cancel_check_interval: default_cancel_check_interval(),
        }
    }
}

impl MctsConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.num_simulations == 0 {
            return Err(EngineError::InvalidConfig("num_simulations must be at least 1".into()));
        }
        if self.cancel_check_interval == 0 {
            return Err(EngineError::InvalidConfig(
                "cancel_check_interval must be at least 1".into(),
            ));
        }
        let finite = [
            self.cpuct,
            self.dirichlet_alpha,
            self.dirichlet_weight,
            self.fpu_reduction,
            self.prob_full_search,
            self.forced_playout_coefficient,
            self.temperature,
        ];
        if finite.iter().any(|value| !value.is_finite()) {
            return Err(EngineError::InvalidConfig("search constants must be finite".into()));
        }
        if self.temperature < 0.0 {
            return Err(EngineError::InvalidConfig("temperature must be non-negative".into()));
        }
        Ok(())
    }
}

struct TreeNode {
    policy: [f32; ACTION_SIZE],
    valid: [bool; ACTION_SIZE],
    visit_count: u32,
    qsa: [f32; ACTION_SIZE],
    nsa: [u32; ACTION_SIZE],
    mean_value: f32,
    terminal_value: Option<f32>,
    round: u16,
}

impl TreeNode {
    fn from_prediction(
        valid: [bool; ACTION_SIZE],
        prediction: &NetworkPrediction,
        round: u16,
    ) -> Self {
        let mut policy = [0.0; ACTION_SIZE];
        let mut sum = 0.0;
        let mut valid_count = 0usize;
        for (idx, valid_flag) in valid.iter().copied().enumerate() {
            if !valid_flag {
                continue;
            }
            let score = prediction.pi.get(idx).copied().unwrap_or(0.0).exp();
            policy[idx] = score;
            sum += score;
            valid_count += 1;
        }

        if sum <= EPS || !sum.is_finite() {
            if valid_count > 0 {
                let uniform = 1.0 / valid_count as f32;
                for (idx, flag) in valid.iter().copied().enumerate() {
                    policy[idx] = if flag { uniform } else { 0.0 };
                }
            }
        } else {
            for (idx, flag) in valid.iter().copied().enumerate() {
                if flag {
                    policy[idx] /= sum;
                } else {
                    policy[idx] = 0.0;
                }
            }
        }

        Self {
            policy,
            valid,
            visit_count: 0,
            qsa: [0.0; ACTION_SIZE],
            nsa: [0; ACTION_SIZE],
            mean_value: prediction.v,
            terminal_value: None,
            round,
        }
    }

    /// Terminal nodes are never expanded, so they carry no mask or prior.
    fn terminal(value: f32, round: u16) -> Self {
        Self {
            policy: [0.0; ACTION_SIZE],
            valid: [false; ACTION_SIZE],
            visit_count: 0,
            qsa: [0.0; ACTION_SIZE],
            nsa: [0; ACTION_SIZE],
            mean_value: value,
            terminal_value: Some(value),
            round,
        }
    }

    fn select_action(
        &self,
        cpuct: f32,
        fpu: f32,
        forced_playouts: bool,
        iteration: u32,
        coefficient: f32,
    ) -> usize {
        let sqrt_ns = (self.visit_count as f32 + EPS).sqrt();
        let total = (self.visit_count as f32).sqrt();
        let base_fpu = self.mean_value - fpu;
        let mut best = MIN_FLOAT;
        let mut best_action = 0;
        let iter_f = iteration.max(1) as f32;
        for (action, valid_flag) in self.valid.iter().copied().enumerate() {
            if !valid_flag {
                continue;
            }
            if forced_playouts {
                let expected = (coefficient * self.policy[action].max(0.0) * iter_f)
                    .sqrt()
                    .floor() as u32;
                if self.nsa[action] < expected {
                    return action;
                }
            }
            let visits = self.nsa[action];
            let u = if visits == 0 {
                base_fpu + cpuct * self.policy[action] * sqrt_ns
            } else {
                self.qsa[action] + cpuct * self.policy[action] * total / (1.0 + visits as f32)
            };
            if u > best {
                best = u;
                best_action = action;
            }
        }
        best_action
    }

    /// Running mean where the prior value counts as the first sample.
    fn record_value(&mut self, value: f32) {
        let weight = (self.visit_count + 1) as f32;
        self.mean_value = (self.mean_value * weight + value) / (weight + 1.0);
        self.visit_count += 1;
    }

    fn apply_dirichlet(&mut self, rng: &mut SmallRng, alpha: f32, weight: f32) {
        if weight <= 0.0 || alpha <= 0.0 {
            return;
        }
        let valid_indices: SmallVec<[usize; 64]> = self
            .valid
            .iter()
            .enumerate()
            .filter_map(|(i, &flag)| flag.then_some(i))
            .collect();
        if valid_indices.len() < 2 {
            return;
        }
        let alphas = vec![alpha as f64; valid_indices.len()];
        let Ok(dirichlet) = Dirichlet::new(&alphas) else {
            return;
        };
        let samples = dirichlet.sample(rng);
        for (value, idx) in samples.iter().zip(valid_indices.iter()) {
            self.policy[*idx] = (1.0 - weight) * self.policy[*idx] + weight * (*value as f32);
        }
        let sum: f32 = valid_indices.iter().map(|&idx| self.policy[idx]).sum();
        if sum > EPS {
            for &idx in &valid_indices {
                self.policy[idx] /= sum;
            }
        }
    }
}

/// Root statistics of a completed search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub version: u8,
    /// Move distribution over the full action space; zero on every illegal id.
    pub policy: Vec<f32>,
    /// Root value as `[player 0, player 1]`.
    pub q: [f32; 2],
    pub visits: Vec<u32>,
    pub full_search: bool,
    pub simulations: u32,
}

#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Completed(SearchResult),
    Cancelled(CancelReason),
}

/// (parent key, action taken, whether the side to move changed)
type Crumb = ([i8; STATE_SIZE], usize, bool);

/// Monte Carlo Tree Search over canonical boards, guided by an injected leaf [`Evaluator`].
///
/// The transposition table survives between searches so consecutive calls on related positions
/// reuse earlier work; it is pruned by round every `cleanup_interval` rounds. The search itself
/// is `async` so a browser evaluator can answer with a Promise; with a plain [`Predictor`] the
/// synchronous wrappers ([`search`](Self::search)) run it to completion in place.
pub struct SantoriniMcts<E = Box<dyn Predictor>> {
    config: MctsConfig,
    evaluator: E,
    rng: SmallRng,
    nodes: HashMap<[i8; STATE_SIZE], TreeNode>,
    last_cleanup_round: u16,
}

/// Budget and mode chosen for one search before any simulation runs.
struct SearchPlan {
    board: BoardState,
    root_player: usize,
    num_sims: u32,
    full_search: bool,
}

impl<E> SantoriniMcts<E> {
    pub fn new(config: MctsConfig, evaluator: E) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            evaluator,
            rng: SmallRng::from_entropy(),
            nodes: HashMap::new(),
            last_cleanup_round: 0,
        })
    }

    pub fn config(&self) -> &MctsConfig {
        &self.config
    }

    pub fn set_num_simulations(&mut self, num_simulations: u32) -> Result<(), EngineError> {
        let mut config = self.config.clone();
        config.num_simulations = num_simulations;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    pub fn tree_size(&self) -> usize {
        self.nodes.len()
    }

    /// Forget every cached node. Needed when the position changes outside the game tree (edits,
    /// imported snapshots), since their subtrees were never reached by play.
    pub fn clear_tree(&mut self) {
        self.nodes.clear();
        self.last_cleanup_round = 0;
    }

    fn plan(&mut self, board: &BoardState, player: usize, force_full_search: bool) -> SearchPlan {
        let mut full_search = force_full_search;
        if !full_search {
            let roll: f32 = self.rng.gen();
            if roll < self.config.prob_full_search {
                full_search = true;
            }
        }
        let mut num_sims = self.config.num_simulations;
        if !full_search {
            num_sims = (num_sims / self.config.partial_divisor.max(1)).max(1);
        }
        SearchPlan {
            board: board.canonicalised(player),
            root_player: player,
            num_sims,
            full_search,
        }
    }
}

impl<E: Predictor> SantoriniMcts<E> {
    /// Run one search from `board` with `player` to move.
    ///
    /// The token is polled before every batch of `cancel_check_interval` simulations and once
    /// more before the result is assembled; a cancelled search reports why instead of returning
    /// partial statistics. The board is taken by reference and never written.
    pub fn search(
        &mut self,
        board: &BoardState,
        player: usize,
        force_full_search: bool,
        token: &CancellationToken,
    ) -> Result<SearchOutcome, EngineError> {
        resolve_now(self.search_async(board, player, force_full_search, token))?
    }

    pub fn search_with_budget(
        &mut self,
        board: &BoardState,
        player: usize,
        num_simulations: u32,
        token: &CancellationToken,
    ) -> Result<SearchOutcome, EngineError> {
        resolve_now(self.search_with_budget_async(board, player, num_simulations, token))?
    }
}

impl<E: Evaluator> SantoriniMcts<E> {
    pub async fn search_async(
        &mut self,
        board: &BoardState,
        player: usize,
        force_full_search: bool,
        token: &CancellationToken,
    ) -> Result<SearchOutcome, EngineError> {
        let plan = self.plan(board, player, force_full_search);
        self.run_search(plan, token).await
    }

    /// Search with an explicit simulation budget and no root noise, used for follow-up lines
    /// such as per-move evaluation deltas.
    pub async fn search_with_budget_async(
        &mut self,
        board: &BoardState,
        player: usize,
        num_simulations: u32,
        token: &CancellationToken,
    ) -> Result<SearchOutcome, EngineError> {
        let plan = SearchPlan {
            board: board.canonicalised(player),
            root_player: player,
            num_sims: num_simulations.max(1),
            full_search: false,
        };
        self.run_search(plan, token).await
    }

    async fn run_search(
        &mut self,
        plan: SearchPlan,
        token: &CancellationToken,
    ) -> Result<SearchOutcome, EngineError> {
        let SearchPlan {
            board,
            root_player,
            num_sims,
            full_search,
        } = plan;
        let forced_playouts = full_search && self.config.forced_playouts;
        let batch = self.config.cancel_check_interval.max(1);

        for sim in 0..num_sims {
            if sim % batch == 0 {
                self.evaluator.yield_now().await;
                if let Some(reason) = token.reason() {
                    debug!("search cancelled after {sim}/{num_sims} simulations ({reason:?})");
                    return Ok(SearchOutcome::Cancelled(reason));
                }
            }
            let inject_dirichlet = sim == 0 && full_search && self.config.dirichlet_weight > 0.0;
            self.run_single_simulation(&board, inject_dirichlet, sim + 1, forced_playouts)
                .await?;
        }
        if let Some(reason) = token.reason() {
            return Ok(SearchOutcome::Cancelled(reason));
        }

        if !self.config.no_mem_optim {
            self.maybe_cleanup(board.round());
        }

        let key = board.key();
        let (valid, policy_prior, edge_visits, q) = {
            let node = self.nodes.get(&key).ok_or(EngineError::MissingRoot)?;
            (node.valid, node.policy, node.nsa, node.mean_value)
        };

        let (policy, visits) = self.root_distribution(
            &valid,
            &policy_prior,
            &edge_visits,
            self.config.temperature,
            forced_playouts,
            num_sims,
        );
        let green_value = if root_player == 0 { q } else { -q };
        debug!(
            "search finished: {num_sims} simulations, root value {green_value:.3}, tree size {}",
            self.nodes.len()
        );
        Ok(SearchOutcome::Completed(SearchResult {
            version: SEARCH_RESULT_VERSION,
            policy,
            q: [green_value, -green_value],
            visits,
            full_search,
            simulations: num_sims,
        }))
    }

    async fn run_single_simulation(
        &mut self,
        root: &BoardState,
        apply_dirichlet: bool,
        iteration: u32,
        forced_playouts: bool,
    ) -> Result<(), EngineError> {
        let mut board = *root;
        let mut breadcrumbs: SmallVec<[Crumb; 16]> = SmallVec::new();

        loop {
            let key = board.key();
            if let Some(node) = self.nodes.get_mut(&key) {
                if apply_dirichlet && breadcrumbs.is_empty() {
                    node.apply_dirichlet(
                        &mut self.rng,
                        self.config.dirichlet_alpha,
                        self.config.dirichlet_weight,
                    );
                }
                if let Some(result) = node.terminal_value {
                    self.backpropagate(&breadcrumbs, result);
                    return Ok(());
                }
                let action = node.select_action(
                    self.config.cpuct,
                    self.config.fpu_reduction,
                    forced_playouts,
                    iteration,
                    self.config.forced_playout_coefficient,
                );
                let next_player = board.make_move(action, 0)?;
                // A turn change flips perspective so the canonical side to move stays player 0.
                breadcrumbs.push((key, action, next_player == 1));
                board = board.canonicalised(next_player);
                continue;
            }

            if let Some(terminal) = board.result_value(0) {
                self.nodes.insert(key, TreeNode::terminal(terminal, board.round()));
                self.backpropagate(&breadcrumbs, terminal);
                return Ok(());
            }

            let mut valid = [false; ACTION_SIZE];
            board.valid_moves(0, &mut valid);
            let prediction = self.predict(&board, &valid).await?;
            let node = TreeNode::from_prediction(valid, &prediction, board.round());
            let leaf_value = node.mean_value;
            self.nodes.insert(key, node);
            self.backpropagate(&breadcrumbs, leaf_value);
            return Ok(());
        }
    }

    async fn predict(
        &mut self,
        board: &BoardState,
        valid: &[bool; ACTION_SIZE],
    ) -> Result<NetworkPrediction, PredictorError> {
        let prediction = self.evaluator.evaluate(&board.as_bytes(), valid).await?;
        if prediction.pi.len() < ACTION_SIZE {
            return Err(PredictorError::ShortPolicy(prediction.pi.len()));
        }
        if !prediction.v.is_finite() {
            return Err(PredictorError::NonFinite);
        }
        Ok(prediction)
    }
}

impl<E> SantoriniMcts<E> {
    /// `value` starts from the leaf's side to move and is negated whenever a crumb flipped sides.
    fn backpropagate(&mut self, path: &[Crumb], mut value: f32) {
        for (key, action, flipped) in path.iter().rev() {
            if *flipped {
                value = -value;
            }
            if let Some(node) = self.nodes.get_mut(key) {
                node.record_value(value);

                let edge_visits = &mut node.nsa[*action];
                *edge_visits += 1;
                let edge_visits_f = *edge_visits as f32;
                let edge_value = &mut node.qsa[*action];
                *edge_value += (value - *edge_value) / edge_visits_f;
            }
        }
    }

    fn maybe_cleanup(&mut self, current_round: u16) {
        if current_round <= self.last_cleanup_round + self.config.cleanup_interval {
            return;
        }
        let threshold = current_round.saturating_sub(self.config.retain_rounds);
        self.nodes.retain(|_, node| node.round >= threshold);
        self.last_cleanup_round = current_round;
    }

    fn root_distribution(
        &mut self,
        valid: &[bool; ACTION_SIZE],
        policy: &[f32; ACTION_SIZE],
        visits: &[u32; ACTION_SIZE],
        temperature: f32,
        forced_playouts: bool,
        num_sims: u32,
    ) -> (Vec<f32>, Vec<u32>) {
        let mut counts: Vec<f32> = visits
            .iter()
            .zip(valid.iter())
            .map(|(&count, &flag)| if flag { count as f32 } else { 0.0 })
            .collect();

        if forced_playouts {
            // Subtract the visits forced playouts added to non-best edges.
            let best_visit = visits
                .iter()
                .zip(valid.iter())
                .filter(|(_, &flag)| flag)
                .map(|(&count, _)| count)
                .max()
                .unwrap_or(0);
            if best_visit > 0 {
                for idx in 0..ACTION_SIZE {
                    if !valid[idx] || visits[idx] == best_visit {
                        continue;
                    }
                    let expected = (self.config.forced_playout_coefficient
                        * policy[idx].max(0.0)
                        * num_sims as f32)
                        .sqrt()
                        .floor() as u32;
                    let adjusted = visits[idx].saturating_sub(expected);
                    counts[idx] = if adjusted > 1 { adjusted as f32 } else { 0.0 };
                }
            }
        }

        let mut policy_vec = vec![0.0f32; ACTION_SIZE];
        if temperature == 0.0 {
            let mut best_value = -1.0f32;
            let mut ties: SmallVec<[usize; 8]> = SmallVec::new();
            for (idx, (&count, &flag)) in counts.iter().zip(valid.iter()).enumerate() {
                if !flag {
                    continue;
                }
                if count > best_value + EPS {
                    best_value = count;
                    ties.clear();
                    ties.push(idx);
                } else if (count - best_value).abs() <= EPS {
                    ties.push(idx);
                }
            }
            if !ties.is_empty() {
                let choice = self.rng.gen_range(0..ties.len());
                policy_vec[ties[choice]] = 1.0;
            }
        } else {
            let temp = temperature.max(0.01);
            let mut total = 0.0f32;
            for (idx, (&count, &flag)) in counts.iter().zip(valid.iter()).enumerate() {
                if !flag || count <= 0.0 {
                    continue;
                }
                let weighted = count.powf(1.0 / temp);
                policy_vec[idx] = weighted;
                total += weighted;
            }
            if total > EPS && total.is_finite() {
                for (idx, &flag) in valid.iter().enumerate() {
                    if flag {
                        policy_vec[idx] /= total;
                    }
                }
            } else {
                policy_vec.fill(0.0);
                let valid_count = valid.iter().filter(|flag| **flag).count();
                if valid_count > 0 {
                    let uniform = 1.0 / valid_count as f32;
                    for (idx, &flag) in valid.iter().enumerate() {
                        if flag {
                            policy_vec[idx] = uniform;
                        }
                    }
                }
            }
        }

        let visits_vec = visits
            .iter()
            .zip(valid.iter())
            .map(|(&count, &flag)| if flag { count } else { 0 })
            .collect();

        (policy_vec, visits_vec)
    }
}
