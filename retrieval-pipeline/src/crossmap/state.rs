use state_machines::state_machine;

state_machine! {
    name: CrossmapMachine,
    state: CrossmapState,
    initial: Ready,
    states: [Ready, Loaded, Queried, Completed, Failed],
    events {
        load { transition: { from: Ready, to: Loaded } }
        query { transition: { from: Loaded, to: Queried } }
        write { transition: { from: Queried, to: Completed } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Loaded, to: Failed }
            transition: { from: Queried, to: Failed }
        }
    }
}

pub fn ready() -> CrossmapMachine<(), Ready> {
    CrossmapMachine::new(())
}
