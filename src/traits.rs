/// A Mealy machine coalgebra: `(State, Event) → (State, Vec<Command>)`.
///
/// The reachability machine implements this so every transition can be
/// exercised without sockets, timers or a runtime.
pub trait MealyMachine: Sized {
    type Event;
    type Command;
    fn transition(self, event: Self::Event) -> (Self, Vec<Self::Command>);
}
