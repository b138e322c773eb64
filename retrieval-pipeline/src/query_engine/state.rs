use state_machines::state_machine;

state_machine! {
    name: QueryMachine,
    state: QueryState,
    initial: Idle,
    states: [Idle, Retrieving, Reranking, Ranked, Failed],
    events {
        retrieve { transition: { from: Idle, to: Retrieving } }
        rerank { transition: { from: Retrieving, to: Reranking } }
        rank { transition: { from: Reranking, to: Ranked } }
        abort {
            transition: { from: Idle, to: Failed }
            transition: { from: Retrieving, to: Failed }
            transition: { from: Reranking, to: Failed }
        }
    }
}

pub fn idle() -> QueryMachine<(), Idle> {
    QueryMachine::new(())
}
